//! XEP-0077: In-Band Registration
//!
//! Lets a client create an account before authenticating, and change its
//! password or cancel its account afterwards.
//!
//! ## Protocol Flow
//!
//! 1. Client requests registration form:
//!    ```xml
//!    <iq type='get' id='reg1'>
//!      <query xmlns='jabber:iq:register'/>
//!    </iq>
//!    ```
//!
//! 2. Server responds with required fields:
//!    ```xml
//!    <iq type='result' id='reg1'>
//!      <query xmlns='jabber:iq:register'>
//!        <username/>
//!        <password/>
//!      </query>
//!    </iq>
//!    ```
//!
//! 3. Client submits registration:
//!    ```xml
//!    <iq type='set' id='reg2'>
//!      <query xmlns='jabber:iq:register'>
//!        <username>alice</username>
//!        <password>secret</password>
//!      </query>
//!    </iq>
//!    ```
//!
//! A stream may register at most one account.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use minidom::Element;
use tracing::{info, warn};

use crate::actor::Actor;
use crate::config::RegistrationConfig;
use crate::disco::DiscoInfo;
use crate::module::{reply_or_error, IqModule};
use crate::stanza::{self, IqType};
use crate::storage::{Storage, User};
use crate::stream::C2sStream;
use crate::{StanzaErrorCondition, XmppError};

/// Namespace for XEP-0077 In-Band Registration
pub const NS_REGISTER: &str = "jabber:iq:register";

/// In-band registration module, one per stream.
pub struct Registration {
    inner: Arc<Inner>,
    actor: Actor,
}

struct Inner {
    config: RegistrationConfig,
    stream: Weak<C2sStream>,
    storage: Arc<dyn Storage>,
    registered: AtomicBool,
}

impl Registration {
    /// Create the module for `stream`.
    pub fn new(
        config: &RegistrationConfig,
        stream: &Arc<C2sStream>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let actor = Actor::spawn(
            format!("xep0077:{}", stream.id()),
            stream.cancellation_token(),
        );
        Self {
            inner: Arc::new(Inner {
                config: config.clone(),
                stream: Arc::downgrade(stream),
                storage,
                registered: AtomicBool::new(false),
            }),
            actor,
        }
    }

    /// Wait until all accepted requests have been answered.
    pub async fn wait_idle(&self) -> Result<(), XmppError> {
        self.actor.barrier().await
    }
}

#[async_trait]
impl IqModule for Registration {
    fn register_disco(&self, disco: &DiscoInfo) {
        if let Some(stream) = self.inner.stream.upgrade() {
            disco.add_feature(&stream.domain(), None, NS_REGISTER);
        }
    }

    fn matches_iq(&self, iq: &Element) -> bool {
        iq.name() == "iq" && iq.get_child("query", NS_REGISTER).is_some()
    }

    async fn process_iq(&self, iq: Element) {
        let inner = Arc::clone(&self.inner);
        if let Err(err) = self.actor.submit(async move { inner.handle(iq).await }).await {
            warn!(error = %err, "Dropping registration request");
        }
    }
}

impl Inner {
    async fn handle(&self, iq: Element) {
        let Some(stream) = self.stream.upgrade() else {
            return;
        };
        let outcome = self.process(&stream, &iq).await;
        stream
            .deliver_element(reply_or_error("xep0077", &iq, outcome))
            .await;
    }

    async fn process(&self, stream: &C2sStream, iq: &Element) -> Result<Element, XmppError> {
        validate_to(stream, iq)?;
        let query = iq.get_child("query", NS_REGISTER);

        if !stream.is_authenticated() {
            return match IqType::of(iq) {
                Some(IqType::Get) => self.send_registration_fields(iq, query),
                Some(IqType::Set) => self.register_new_user(iq, query).await,
                _ => Err(XmppError::bad_request(None)),
            };
        }

        let query = match (IqType::of(iq), query) {
            (Some(IqType::Set), Some(query)) => query,
            _ => return Err(XmppError::bad_request(None)),
        };
        if query.children().any(|c| c.name() == "remove") {
            self.cancel_registration(stream, iq, query).await
        } else if let (Some(username), Some(password)) =
            (field(query, "username"), field(query, "password"))
        {
            self.change_password(stream, iq, &username, &password).await
        } else {
            Err(XmppError::bad_request(None))
        }
    }

    fn send_registration_fields(
        &self,
        iq: &Element,
        query: Option<&Element>,
    ) -> Result<Element, XmppError> {
        if !self.config.allow_registration {
            return Err(not_allowed());
        }
        if query.map_or(false, |q| q.children().next().is_some()) {
            return Err(XmppError::bad_request(None));
        }
        let form = Element::builder("query", NS_REGISTER)
            .append(Element::builder("username", NS_REGISTER).build())
            .append(Element::builder("password", NS_REGISTER).build())
            .build();
        Ok(stanza::result_iq_with(iq, form))
    }

    async fn register_new_user(
        &self,
        iq: &Element,
        query: Option<&Element>,
    ) -> Result<Element, XmppError> {
        if !self.config.allow_registration {
            return Err(not_allowed());
        }
        if self.registered.load(Ordering::SeqCst) {
            return Err(XmppError::not_acceptable(Some(
                "An account was already registered on this stream".to_string(),
            )));
        }
        let (username, password) = match query
            .and_then(|q| Some((field(q, "username")?, field(q, "password")?)))
        {
            Some((username, password)) if !username.is_empty() && !password.is_empty() => {
                (username, password)
            }
            _ => {
                return Err(XmppError::bad_request(Some(
                    "Username and password are required".to_string(),
                )))
            }
        };

        if self.storage.user_exists(&username).await? {
            return Err(XmppError::stanza(StanzaErrorCondition::Conflict, None));
        }
        self.storage
            .insert_or_update_user(&User::new(username.as_str(), password))
            .await?;
        self.registered.store(true, Ordering::SeqCst);
        info!(username = %username, "Registered account");
        Ok(stanza::result_iq(iq))
    }

    async fn cancel_registration(
        &self,
        stream: &C2sStream,
        iq: &Element,
        query: &Element,
    ) -> Result<Element, XmppError> {
        if !self.config.allow_cancel {
            return Err(not_allowed());
        }
        if query.children().count() > 1 {
            return Err(XmppError::bad_request(None));
        }
        let username = stream.username();
        self.storage.delete_user(&username).await?;
        info!(username = %username, "Cancelled account");
        Ok(stanza::result_iq(iq))
    }

    async fn change_password(
        &self,
        stream: &C2sStream,
        iq: &Element,
        username: &str,
        password: &str,
    ) -> Result<Element, XmppError> {
        if !self.config.allow_change {
            return Err(not_allowed());
        }
        if username != stream.username() {
            return Err(not_allowed());
        }
        if !stream.is_secured() {
            return Err(XmppError::stanza(
                StanzaErrorCondition::NotAuthorized,
                Some("Password change requires a secure channel".to_string()),
            ));
        }
        let mut user = self
            .storage
            .fetch_user(username)
            .await?
            .ok_or_else(|| XmppError::stanza(StanzaErrorCondition::ItemNotFound, None))?;
        user.password = password.to_string();
        self.storage.insert_or_update_user(&user).await?;
        info!(username = %username, "Changed account password");
        Ok(stanza::result_iq(iq))
    }
}

fn not_allowed() -> XmppError {
    XmppError::stanza(StanzaErrorCondition::NotAllowed, None)
}

/// Text of the first child named `name`.
fn field(query: &Element, name: &str) -> Option<String> {
    query.children().find(|c| c.name() == name).map(|c| c.text())
}

/// Authenticated streams may only address the server; unauthenticated ones
/// the server or the account being registered.
fn validate_to(stream: &C2sStream, iq: &Element) -> Result<(), XmppError> {
    let Some(to) = stanza::jid_attr(iq, "to")? else {
        return Ok(());
    };
    if stanza::is_server_jid(&to) {
        return Ok(());
    }
    let own_node = to
        .node()
        .map_or(false, |node| node.as_str() == stream.username());
    if !stream.is_authenticated() && own_node {
        Ok(())
    } else {
        Err(XmppError::forbidden(None))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use jid::Jid;

    use super::*;
    use crate::config::StreamConfig;
    use crate::stanza::ns;
    use crate::storage::MemoryStorage;
    use crate::stream::OutboundReceiver;

    const WAIT: Duration = Duration::from_secs(1);

    fn config(allow_registration: bool, allow_change: bool, allow_cancel: bool) -> RegistrationConfig {
        RegistrationConfig {
            allow_registration,
            allow_change,
            allow_cancel,
        }
    }

    fn new_stream() -> (Arc<C2sStream>, OutboundReceiver) {
        let jid: Jid = "ortuman@jackal.im/balcony".parse().unwrap();
        C2sStream::new("abcd1234", &jid, &StreamConfig::default())
    }

    fn iq(kind: &str, to: &str, query: Option<Element>) -> Element {
        let mut builder = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("id", crate::stream::generate_id())
            .attr("type", kind.to_string())
            .attr("from", "ortuman@jackal.im/balcony".to_string())
            .attr("to", to.to_string());
        if let Some(query) = query {
            builder = builder.append(query);
        }
        builder.build()
    }

    fn query(children: &[(&str, &str)]) -> Element {
        let mut builder = Element::builder("query", NS_REGISTER);
        for (name, text) in children {
            let mut child = Element::builder(*name, NS_REGISTER);
            if !text.is_empty() {
                child = child.append(minidom::Node::Text(text.to_string()));
            }
            builder = builder.append(child.build());
        }
        builder.build()
    }

    async fn condition(rx: &mut OutboundReceiver) -> Option<StanzaErrorCondition> {
        let reply = rx.fetch_element(WAIT).await.unwrap();
        stanza::error_condition(&reply)
    }

    async fn reply_type(rx: &mut OutboundReceiver) -> Option<String> {
        let reply = rx.fetch_element(WAIT).await.unwrap();
        reply.attr("type").map(|t| t.to_string())
    }

    fn storage() -> Arc<MemoryStorage> {
        Arc::new(MemoryStorage::new())
    }

    #[tokio::test]
    async fn test_matching() {
        let (stm, _rx) = new_stream();
        let x = Registration::new(&config(false, false, false), &stm, storage());

        assert!(!x.matches_iq(&iq("set", "jackal.im", None)));
        assert!(x.matches_iq(&iq("set", "jackal.im", Some(query(&[])))));
    }

    #[tokio::test]
    async fn test_invalid_to_jid() {
        let (stm, mut rx) = new_stream();
        let x = Registration::new(&config(false, false, false), &stm, storage());

        stm.set_username("romeo");
        x.process_iq(iq("set", "ortuman@jackal.im", None)).await;
        assert_eq!(condition(&mut rx).await, Some(StanzaErrorCondition::Forbidden));

        stm.set_username("ortuman");
        stm.set_authenticated(true);
        x.process_iq(iq("set", "ortuman@jackal.im", None)).await;
        let reply = rx.fetch_element(WAIT).await.unwrap();
        assert_eq!(reply.name(), "iq");
        assert_eq!(
            stanza::error_condition(&reply),
            Some(StanzaErrorCondition::Forbidden)
        );
    }

    #[tokio::test]
    async fn test_not_authenticated_errors() {
        let (stm, mut rx) = new_stream();
        let x = Registration::new(&config(false, false, false), &stm, storage());

        x.process_iq(iq("result", "ortuman@jackal.im", None)).await;
        assert_eq!(condition(&mut rx).await, Some(StanzaErrorCondition::BadRequest));

        x.process_iq(iq("get", "ortuman@jackal.im", None)).await;
        assert_eq!(condition(&mut rx).await, Some(StanzaErrorCondition::NotAllowed));

        // allow registration...
        let x = Registration::new(&config(true, false, false), &stm, storage());
        x.process_iq(iq("get", "ortuman@jackal.im", Some(query(&[("q2", "")]))))
            .await;
        assert_eq!(condition(&mut rx).await, Some(StanzaErrorCondition::BadRequest));

        x.inner.registered.store(true, Ordering::SeqCst);
        x.process_iq(iq("set", "ortuman@jackal.im", Some(query(&[])))).await;
        assert_eq!(
            condition(&mut rx).await,
            Some(StanzaErrorCondition::NotAcceptable)
        );
    }

    #[tokio::test]
    async fn test_authenticated_errors() {
        let (stm, mut rx) = new_stream();
        stm.set_authenticated(true);
        let x = Registration::new(&config(false, false, false), &stm, storage());

        x.process_iq(iq("result", "jackal.im", None)).await;
        assert_eq!(condition(&mut rx).await, Some(StanzaErrorCondition::BadRequest));

        x.process_iq(iq("set", "jackal.im", Some(query(&[])))).await;
        assert_eq!(condition(&mut rx).await, Some(StanzaErrorCondition::BadRequest));

        x.process_iq(iq("get", "jackal.im", Some(query(&[])))).await;
        assert_eq!(condition(&mut rx).await, Some(StanzaErrorCondition::BadRequest));
    }

    #[tokio::test]
    async fn test_register_user() {
        let s = storage();
        let (stm, mut rx) = new_stream();
        let x = Registration::new(
            &config(true, false, false),
            &stm,
            Arc::clone(&s) as Arc<dyn Storage>,
        );

        x.process_iq(iq("get", "jackal.im", Some(query(&[])))).await;
        let reply = rx.fetch_element(WAIT).await.unwrap();
        let form = reply.get_child("query", NS_REGISTER).unwrap();
        assert!(form.get_child("username", NS_REGISTER).is_some());
        assert!(form.get_child("password", NS_REGISTER).is_some());

        // empty fields
        let empty = query(&[("username", ""), ("password", "")]);
        x.process_iq(iq("set", "jackal.im", Some(empty))).await;
        assert_eq!(condition(&mut rx).await, Some(StanzaErrorCondition::BadRequest));

        // already existing user...
        s.insert_or_update_user(&User::new("ortuman", "1234"))
            .await
            .unwrap();
        let existing = query(&[("username", "ortuman"), ("password", "5678")]);
        x.process_iq(iq("set", "jackal.im", Some(existing.clone()))).await;
        assert_eq!(condition(&mut rx).await, Some(StanzaErrorCondition::Conflict));

        // storage error
        s.activate_mocked_error();
        x.process_iq(iq("set", "jackal.im", Some(existing))).await;
        assert_eq!(
            condition(&mut rx).await,
            Some(StanzaErrorCondition::InternalServerError)
        );
        s.deactivate_mocked_error();

        let juliet = query(&[("username", "juliet"), ("password", "5678")]);
        x.process_iq(iq("set", "jackal.im", Some(juliet.clone()))).await;
        assert_eq!(reply_type(&mut rx).await.as_deref(), Some("result"));

        let usr = s.fetch_user("juliet").await.unwrap().unwrap();
        assert_eq!(usr.password, "5678");
        assert!(s.fetch_user("ortuman").await.unwrap().is_some());

        // second registration on the same stream
        x.process_iq(iq("set", "jackal.im", Some(juliet))).await;
        assert_eq!(
            condition(&mut rx).await,
            Some(StanzaErrorCondition::NotAcceptable)
        );
    }

    #[tokio::test]
    async fn test_cancel_registration() {
        let s = storage();
        let (stm, mut rx) = new_stream();
        stm.set_authenticated(true);
        s.insert_or_update_user(&User::new("ortuman", "1234"))
            .await
            .unwrap();

        let x = Registration::new(
            &config(false, false, false),
            &stm,
            Arc::clone(&s) as Arc<dyn Storage>,
        );
        x.process_iq(iq("set", "jackal.im", Some(query(&[("remove", "")]))))
            .await;
        assert_eq!(condition(&mut rx).await, Some(StanzaErrorCondition::NotAllowed));

        let x = Registration::new(
            &config(false, false, true),
            &stm,
            Arc::clone(&s) as Arc<dyn Storage>,
        );
        x.process_iq(iq(
            "set",
            "jackal.im",
            Some(query(&[("remove", ""), ("remove2", "")])),
        ))
        .await;
        assert_eq!(condition(&mut rx).await, Some(StanzaErrorCondition::BadRequest));

        // storage error
        s.activate_mocked_error();
        x.process_iq(iq("set", "jackal.im", Some(query(&[("remove", "")]))))
            .await;
        assert_eq!(
            condition(&mut rx).await,
            Some(StanzaErrorCondition::InternalServerError)
        );
        s.deactivate_mocked_error();

        x.process_iq(iq("set", "jackal.im", Some(query(&[("remove", "")]))))
            .await;
        assert_eq!(reply_type(&mut rx).await.as_deref(), Some("result"));
        assert!(s.fetch_user("ortuman").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_change_password() {
        let s = storage();
        let (stm, mut rx) = new_stream();
        stm.set_authenticated(true);
        s.insert_or_update_user(&User::new("ortuman", "1234"))
            .await
            .unwrap();

        let juliet = query(&[("username", "juliet"), ("password", "5678")]);
        let ortuman = query(&[("username", "ortuman"), ("password", "5678")]);

        let x = Registration::new(
            &config(false, false, false),
            &stm,
            Arc::clone(&s) as Arc<dyn Storage>,
        );
        x.process_iq(iq("set", "jackal.im", Some(juliet.clone()))).await;
        assert_eq!(condition(&mut rx).await, Some(StanzaErrorCondition::NotAllowed));

        let x = Registration::new(
            &config(false, true, false),
            &stm,
            Arc::clone(&s) as Arc<dyn Storage>,
        );
        x.process_iq(iq("set", "jackal.im", Some(juliet))).await;
        assert_eq!(condition(&mut rx).await, Some(StanzaErrorCondition::NotAllowed));

        x.process_iq(iq("set", "jackal.im", Some(ortuman.clone()))).await;
        assert_eq!(
            condition(&mut rx).await,
            Some(StanzaErrorCondition::NotAuthorized)
        );

        // secure channel...
        stm.set_secured(true);

        // storage error
        s.activate_mocked_error();
        x.process_iq(iq("set", "jackal.im", Some(ortuman.clone()))).await;
        assert_eq!(
            condition(&mut rx).await,
            Some(StanzaErrorCondition::InternalServerError)
        );
        s.deactivate_mocked_error();

        x.process_iq(iq("set", "jackal.im", Some(ortuman))).await;
        assert_eq!(reply_type(&mut rx).await.as_deref(), Some("result"));

        let usr = s.fetch_user("ortuman").await.unwrap().unwrap();
        assert_eq!(usr.password, "5678");
    }

    #[tokio::test]
    async fn test_register_disco() {
        let (stm, _rx) = new_stream();
        let x = Registration::new(&config(true, true, true), &stm, storage());
        let disco = DiscoInfo::new();
        x.register_disco(&disco);
        assert!(disco.has_feature("jackal.im", None, NS_REGISTER));
    }
}
