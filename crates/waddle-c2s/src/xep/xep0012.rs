//! XEP-0012: Last Activity
//!
//! Answers server uptime queries and idle-time queries about contacts the
//! requester is subscribed to.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jid::Jid;
use minidom::{Element, Node};
use tracing::debug;

use crate::disco::DiscoInfo;
use crate::module::{reply_or_error, IqModule};
use crate::registry::StreamRegistry;
use crate::stanza::{self, IqType};
use crate::storage::Storage;
use crate::stream::C2sStream;
use crate::{StanzaErrorCondition, XmppError};

/// Namespace for XEP-0012 Last Activity
pub const NS_LAST: &str = "jabber:iq:last";

/// Last activity module, one per stream.
pub struct LastActivity {
    inner: Arc<Inner>,
}

struct Inner {
    stream: Weak<C2sStream>,
    storage: Arc<dyn Storage>,
    registry: Arc<StreamRegistry>,
    started_at: DateTime<Utc>,
}

impl LastActivity {
    /// Create the module for `stream`. Uptime is counted from here.
    pub fn new(
        stream: &Arc<C2sStream>,
        storage: Arc<dyn Storage>,
        registry: Arc<StreamRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                stream: Arc::downgrade(stream),
                storage,
                registry,
                started_at: Utc::now(),
            }),
        }
    }
}

#[async_trait]
impl IqModule for LastActivity {
    fn register_disco(&self, disco: &DiscoInfo) {
        let Some(stream) = self.inner.stream.upgrade() else {
            return;
        };
        disco.add_feature(&stream.domain(), None, NS_LAST);
        if let Some(bare) = stream.bare_jid() {
            disco.add_feature(bare.as_str(), None, NS_LAST);
        }
    }

    fn matches_iq(&self, iq: &Element) -> bool {
        stanza::is_iq_type(iq, IqType::Get) && iq.get_child("query", NS_LAST).is_some()
    }

    async fn process_iq(&self, iq: Element) {
        let Some(stream) = self.inner.stream.upgrade() else {
            return;
        };
        let token = stream.cancellation_token();
        drop(stream);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("Stream cancelled, abandoning last activity request");
                }
                _ = inner.handle(iq) => {}
            }
        });
    }
}

impl Inner {
    async fn handle(&self, iq: Element) {
        let Some(stream) = self.stream.upgrade() else {
            return;
        };
        let outcome = self.process(&stream, &iq).await;
        stream
            .deliver_element(reply_or_error("xep0012", &iq, outcome))
            .await;
    }

    async fn process(&self, stream: &C2sStream, iq: &Element) -> Result<Element, XmppError> {
        match stanza::jid_attr(iq, "to")? {
            None => Ok(self.server_uptime(iq)),
            Some(to) if stanza::is_server_jid(&to) => Ok(self.server_uptime(iq)),
            Some(to) if to.resource().is_none() => self.user_last_activity(stream, iq, &to).await,
            // full JIDs are answered by the client itself
            Some(_) => Err(XmppError::service_unavailable(None)),
        }
    }

    fn server_uptime(&self, iq: &Element) -> Element {
        let secs = (Utc::now() - self.started_at).num_seconds().max(0);
        build_reply(iq, secs, None)
    }

    async fn user_last_activity(
        &self,
        stream: &C2sStream,
        iq: &Element,
        to: &Jid,
    ) -> Result<Element, XmppError> {
        let contact = to.to_bare();
        let item = self
            .storage
            .fetch_roster_item(&stream.username(), contact.as_str())
            .await?;
        if !item.map_or(false, |i| i.subscription.receives_presence()) {
            return Err(XmppError::forbidden(None));
        }

        let username = to.node().map(|n| n.as_str().to_string()).unwrap_or_default();
        if self.registry.is_online(&username) {
            return Ok(build_reply(iq, 0, None));
        }

        let user = self
            .storage
            .fetch_user(&username)
            .await?
            .ok_or_else(|| XmppError::stanza(StanzaErrorCondition::ItemNotFound, None))?;
        let secs = user
            .last_presence_at
            .map(|at| (Utc::now() - at).num_seconds().max(0))
            .unwrap_or(0);
        Ok(build_reply(iq, secs, user.last_status()))
    }
}

fn build_reply(iq: &Element, secs: i64, status: Option<String>) -> Element {
    let mut query = Element::builder("query", NS_LAST).attr("seconds", secs.to_string());
    if let Some(status) = status {
        query = query.append(Node::Text(status));
    }
    stanza::result_iq_with(iq, query.build())
}
