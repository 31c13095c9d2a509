//! XEP-0049: Private XML Storage
//!
//! Allows users to store arbitrary XML data on the server, keyed by namespace.
//! A set replaces every fragment stored under each namespace it carries.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use minidom::Element;
use tracing::{info, warn};

use crate::actor::Actor;
use crate::disco::DiscoInfo;
use crate::module::{reply_or_error, IqModule};
use crate::stanza::{self, IqType};
use crate::storage::Storage;
use crate::stream::C2sStream;
use crate::XmppError;

/// Namespace for private XML storage.
pub const NS_PRIVATE: &str = "jabber:iq:private";

/// Whether clients may store data under `namespace`.
///
/// Protocol namespaces (`jabber:*`, `http://jabber.org/*`) and `vcard-temp`
/// are reserved.
pub fn is_valid_namespace(namespace: &str) -> bool {
    !namespace.starts_with("jabber:")
        && !namespace.starts_with("http://jabber.org/")
        && namespace != "vcard-temp"
}

/// Private XML storage module, one per stream.
pub struct PrivateStorage {
    inner: Arc<Inner>,
    actor: Actor,
}

struct Inner {
    stream: Weak<C2sStream>,
    storage: Arc<dyn Storage>,
}

impl PrivateStorage {
    /// Create the module for `stream`.
    pub fn new(stream: &Arc<C2sStream>, storage: Arc<dyn Storage>) -> Self {
        let actor = Actor::spawn(
            format!("xep0049:{}", stream.id()),
            stream.cancellation_token(),
        );
        Self {
            inner: Arc::new(Inner {
                stream: Arc::downgrade(stream),
                storage,
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
impl IqModule for PrivateStorage {
    fn register_disco(&self, disco: &DiscoInfo) {
        if let Some(stream) = self.inner.stream.upgrade() {
            disco.add_feature(&stream.domain(), None, NS_PRIVATE);
        }
    }

    fn matches_iq(&self, iq: &Element) -> bool {
        iq.name() == "iq" && iq.get_child("query", NS_PRIVATE).is_some()
    }

    async fn process_iq(&self, iq: Element) {
        let inner = Arc::clone(&self.inner);
        if let Err(err) = self.actor.submit(async move { inner.handle(iq).await }).await {
            warn!(error = %err, "Dropping private storage request");
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
            .deliver_element(reply_or_error("xep0049", &iq, outcome))
            .await;
    }

    async fn process(&self, stream: &C2sStream, iq: &Element) -> Result<Element, XmppError> {
        let query = iq
            .get_child("query", NS_PRIVATE)
            .ok_or_else(|| XmppError::bad_request(Some("Missing private query".to_string())))?;

        validate_to(stream, iq)?;

        match IqType::of(iq) {
            Some(IqType::Get) => self.get_private(stream, iq, query).await,
            Some(IqType::Set) => self.set_private(stream, iq, query).await,
            _ => Err(XmppError::bad_request(None)),
        }
    }

    async fn get_private(
        &self,
        stream: &C2sStream,
        iq: &Element,
        query: &Element,
    ) -> Result<Element, XmppError> {
        let mut children = query.children();
        let requested = match (children.next(), children.next()) {
            (Some(requested), None) => requested,
            _ => {
                return Err(XmppError::not_acceptable(Some(
                    "Exactly one private element must be requested".to_string(),
                )))
            }
        };
        let namespace = requested.ns();
        if requested.children().next().is_some() || !is_valid_namespace(&namespace) {
            return Err(XmppError::not_acceptable(None));
        }

        let username = stream.username();
        info!(
            namespace = %namespace,
            username = %username,
            resource = %stream.resource(),
            "Retrieving private element"
        );

        let mut result = Element::builder("query", NS_PRIVATE);
        match self.storage.fetch_private_xml(&namespace, &username).await? {
            Some(fragments) => {
                for fragment in fragments {
                    result = result.append(fragment);
                }
            }
            None => {
                result = result.append(Element::builder(requested.name(), namespace.as_str()).build());
            }
        }
        Ok(stanza::result_iq_with(iq, result.build()))
    }

    async fn set_private(
        &self,
        stream: &C2sStream,
        iq: &Element,
        query: &Element,
    ) -> Result<Element, XmppError> {
        let mut by_namespace: BTreeMap<String, Vec<Element>> = BTreeMap::new();
        for fragment in query.children() {
            let namespace = fragment.ns();
            if namespace.is_empty() {
                return Err(XmppError::bad_request(Some(
                    "Private element without namespace".to_string(),
                )));
            }
            if !is_valid_namespace(&namespace) {
                return Err(XmppError::not_acceptable(None));
            }
            by_namespace
                .entry(namespace)
                .or_default()
                .push(fragment.clone());
        }

        let username = stream.username();
        for (namespace, fragments) in by_namespace {
            info!(
                namespace = %namespace,
                username = %username,
                resource = %stream.resource(),
                "Saving private element"
            );
            self.storage
                .insert_or_update_private_xml(&fragments, &namespace, &username)
                .await?;
        }
        Ok(stanza::result_iq(iq))
    }
}

/// Only the server or the user's own bare JID may be addressed.
fn validate_to(stream: &C2sStream, iq: &Element) -> Result<(), XmppError> {
    let Some(to) = stanza::jid_attr(iq, "to")? else {
        return Ok(());
    };
    let domain = stream.domain();
    let own_server = stanza::is_server_jid(&to) && to.domain().as_str() == domain;
    if own_server || stanza::is_own_bare_jid(&to, &stream.username(), &domain) {
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
    use crate::storage::MemoryStorage;
    use crate::stream::OutboundReceiver;
    use crate::{stanza::ns, StanzaErrorCondition};

    const WAIT: Duration = Duration::from_secs(1);

    fn setup() -> (Arc<C2sStream>, OutboundReceiver, Arc<MemoryStorage>, PrivateStorage) {
        let jid: Jid = "ortuman@jackal.im/balcony".parse().unwrap();
        let (stm, rx) = C2sStream::new("abcd", &jid, &StreamConfig::default());
        let storage = Arc::new(MemoryStorage::new());
        let x = PrivateStorage::new(&stm, Arc::clone(&storage) as Arc<dyn Storage>);
        (stm, rx, storage, x)
    }

    fn iq(id: &str, kind: &str, query: Element) -> Element {
        Element::builder("iq", ns::JABBER_CLIENT)
            .attr("id", id.to_string())
            .attr("type", kind.to_string())
            .attr("from", "ortuman@jackal.im/balcony".to_string())
            .attr("to", "ortuman@jackal.im".to_string())
            .append(query)
            .build()
    }

    fn query(children: Vec<Element>) -> Element {
        let mut builder = Element::builder("query", NS_PRIVATE);
        for child in children {
            builder = builder.append(child);
        }
        builder.build()
    }

    async fn reply_condition(rx: &mut OutboundReceiver) -> Option<StanzaErrorCondition> {
        let reply = rx.fetch_element(WAIT).await.unwrap();
        stanza::error_condition(&reply)
    }

    #[test]
    fn test_reserved_namespaces() {
        assert!(!is_valid_namespace("jabber:client"));
        assert!(!is_valid_namespace("jabber:iq:roster"));
        assert!(!is_valid_namespace("http://jabber.org/protocol/disco#info"));
        assert!(!is_valid_namespace("vcard-temp"));
        assert!(is_valid_namespace("vcard-temp:x:update"));
        assert!(is_valid_namespace("exodus:ns"));
        assert!(is_valid_namespace("storage:bookmarks"));
    }

    #[tokio::test]
    async fn test_matching() {
        let (_stm, _rx, _storage, x) = setup();

        let bare = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", "get".to_string())
            .build();
        assert!(!x.matches_iq(&bare));
        assert!(x.matches_iq(&iq("q1", "get", query(vec![]))));
    }

    #[tokio::test]
    async fn test_invalid_iq() {
        let (stm, mut rx, _storage, x) = setup();

        // addressed to somebody else's account
        stm.set_username("romeo");
        x.process_iq(iq("q1", "get", query(vec![]))).await;
        assert_eq!(
            reply_condition(&mut rx).await,
            Some(StanzaErrorCondition::Forbidden)
        );

        stm.set_username("ortuman");
        x.process_iq(iq("q2", "result", query(vec![]))).await;
        assert_eq!(
            reply_condition(&mut rx).await,
            Some(StanzaErrorCondition::BadRequest)
        );

        // get with no requested element
        x.process_iq(iq("q3", "get", query(vec![]))).await;
        assert_eq!(
            reply_condition(&mut rx).await,
            Some(StanzaErrorCondition::NotAcceptable)
        );

        // get of an element with children
        let exodus = Element::builder("exodus", "exodus:ns")
            .append(Element::builder("exodus2", "exodus:ns").build())
            .build();
        x.process_iq(iq("q4", "get", query(vec![exodus]))).await;
        assert_eq!(
            reply_condition(&mut rx).await,
            Some(StanzaErrorCondition::NotAcceptable)
        );

        // set of a reserved namespace
        let reserved = Element::builder("exodus", "jabber:client").build();
        x.process_iq(iq("q5", "set", query(vec![reserved]))).await;
        assert_eq!(
            reply_condition(&mut rx).await,
            Some(StanzaErrorCondition::NotAcceptable)
        );

        // set without namespace
        let unqualified = Element::builder("exodus", "").build();
        x.process_iq(iq("q6", "set", query(vec![unqualified]))).await;
        assert_eq!(
            reply_condition(&mut rx).await,
            Some(StanzaErrorCondition::BadRequest)
        );
    }

    #[tokio::test]
    async fn test_reserved_namespaces_are_rejected_for_get_and_set() {
        let (_stm, mut rx, _storage, x) = setup();

        for namespace in ["jabber:iq:roster", "http://jabber.org/protocol/muc", "vcard-temp"] {
            let fragment = Element::builder("data", namespace).build();
            x.process_iq(iq("g", "get", query(vec![fragment.clone()]))).await;
            assert_eq!(
                reply_condition(&mut rx).await,
                Some(StanzaErrorCondition::NotAcceptable)
            );
            x.process_iq(iq("s", "set", query(vec![fragment]))).await;
            assert_eq!(
                reply_condition(&mut rx).await,
                Some(StanzaErrorCondition::NotAcceptable)
            );
        }
    }

    #[tokio::test]
    async fn test_addressing_server_is_allowed() {
        let (_stm, mut rx, _storage, x) = setup();
        let mut request = iq("q1", "get", query(vec![Element::builder("exodus", "exodus:ns").build()]));
        request.set_attr("to", "jackal.im");
        x.process_iq(request).await;

        let reply = rx.fetch_element(WAIT).await.unwrap();
        assert_eq!(reply.attr("type"), Some("result"));

        let mut request = iq("q2", "get", query(vec![Element::builder("exodus", "exodus:ns").build()]));
        request.set_attr("to", "example.org");
        x.process_iq(request).await;
        assert_eq!(
            reply_condition(&mut rx).await,
            Some(StanzaErrorCondition::Forbidden)
        );
    }

    #[tokio::test]
    async fn test_set_and_get_private() {
        let (_stm, mut rx, storage, x) = setup();

        let exodus1 = Element::builder("exodus1", "exodus:ns").build();
        let exodus2 = Element::builder("exodus2", "exodus:ns").build();
        let set = iq("set1", "set", query(vec![exodus1.clone(), exodus2]));

        // set error
        storage.activate_mocked_error();
        x.process_iq(set.clone()).await;
        assert_eq!(
            reply_condition(&mut rx).await,
            Some(StanzaErrorCondition::InternalServerError)
        );
        storage.deactivate_mocked_error();

        // set success
        x.process_iq(set).await;
        let reply = rx.fetch_element(WAIT).await.unwrap();
        assert_eq!(reply.attr("type"), Some("result"));
        assert_eq!(reply.attr("id"), Some("set1"));

        // get error
        let get = iq("get1", "get", query(vec![exodus1]));
        storage.activate_mocked_error();
        x.process_iq(get.clone()).await;
        assert_eq!(
            reply_condition(&mut rx).await,
            Some(StanzaErrorCondition::InternalServerError)
        );
        storage.deactivate_mocked_error();

        // get success
        x.process_iq(get).await;
        let reply = rx.fetch_element(WAIT).await.unwrap();
        assert_eq!(reply.attr("type"), Some("result"));
        assert_eq!(reply.attr("id"), Some("get1"));
        let q = reply.get_child("query", NS_PRIVATE).unwrap();
        let stored: Vec<&Element> = q.children().collect();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].ns(), "exodus:ns");

        // get non existing
        let missing = Element::builder("exodus1", "exodus:ns:2").build();
        x.process_iq(iq("get2", "get", query(vec![missing]))).await;
        let reply = rx.fetch_element(WAIT).await.unwrap();
        assert_eq!(reply.attr("type"), Some("result"));
        let q = reply.get_child("query", NS_PRIVATE).unwrap();
        let stored: Vec<&Element> = q.children().collect();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name(), "exodus1");
        assert_eq!(stored[0].ns(), "exodus:ns:2");
    }

    #[tokio::test]
    async fn test_set_then_get_observes_submission_order() {
        let (_stm, mut rx, _storage, x) = setup();

        let a = Element::builder("a", "ns:a").build();
        let b = Element::builder("b", "ns:b").build();

        // submitted back-to-back without waiting for replies
        x.process_iq(iq("set-a", "set", query(vec![a.clone()]))).await;
        x.process_iq(iq("get-b", "get", query(vec![b.clone()]))).await;
        x.process_iq(iq("set-b", "set", query(vec![b.clone()]))).await;
        x.process_iq(iq("get-a", "get", query(vec![a.clone()]))).await;
        x.wait_idle().await.unwrap();

        let ids: Vec<String> = std::iter::from_fn(|| rx.try_recv())
            .map(|r| r.attr("id").unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["set-a", "get-b", "set-b", "get-a"]);

        // replay reading both namespaces now that both sets have run
        x.process_iq(iq("get-b2", "get", query(vec![b]))).await;
        let reply = rx.fetch_element(WAIT).await.unwrap();
        let q = reply.get_child("query", NS_PRIVATE).unwrap();
        assert_eq!(q.children().next().unwrap().ns(), "ns:b");
    }

    #[tokio::test]
    async fn test_set_groups_by_namespace() {
        let (_stm, mut rx, storage, x) = setup();

        let fragments = vec![
            Element::builder("one", "ns:a").build(),
            Element::builder("two", "ns:b").build(),
            Element::builder("three", "ns:a").build(),
        ];
        x.process_iq(iq("s1", "set", query(fragments))).await;
        let reply = rx.fetch_element(WAIT).await.unwrap();
        assert_eq!(reply.attr("type"), Some("result"));

        let a = storage.fetch_private_xml("ns:a", "ortuman").await.unwrap().unwrap();
        let names: Vec<&str> = a.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["one", "three"]);
        let b = storage.fetch_private_xml("ns:b", "ortuman").await.unwrap().unwrap();
        assert_eq!(b.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_stops_processing() {
        let (stm, mut rx, _storage, x) = setup();
        stm.disconnect(None);
        x.process_iq(iq("q1", "get", query(vec![]))).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_every_request_is_answered_with_small_sink() {
        let jid: Jid = "ortuman@jackal.im/balcony".parse().unwrap();
        let (stm, mut rx) = C2sStream::new(
            "abcd",
            &jid,
            &StreamConfig {
                outbound_capacity: 1,
            },
        );
        let storage = Arc::new(MemoryStorage::new());
        let x = PrivateStorage::new(&stm, storage as Arc<dyn Storage>);

        let ids = ["q1", "q2", "q3"];
        for id in ids {
            let requested = Element::builder("exodus", "exodus:ns").build();
            x.process_iq(iq(id, "get", query(vec![requested]))).await;
        }

        let mut replied = Vec::new();
        for _ in ids {
            let reply = rx.fetch_element(WAIT).await.unwrap();
            assert_eq!(reply.attr("type"), Some("result"));
            replied.push(reply.attr("id").unwrap().to_string());
        }
        x.wait_idle().await.unwrap();
        assert_eq!(replied, ids);
        assert!(rx.try_recv().is_none());
    }
}
