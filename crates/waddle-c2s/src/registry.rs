//! Stream Registry implementation.
//!
//! Tracks bound client streams by their full JID, runs the bind/unbind flow
//! and routes messages either to a live stream or to the offline engine.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use jid::{FullJid, Jid};
use minidom::Element;
use tracing::{debug, info, instrument};

use crate::offline::{self, Offline};
use crate::stanza::{self, ns};
use crate::storage::Storage;
use crate::stream::C2sStream;
use crate::{metrics, StanzaErrorCondition, XmppError};

/// Result of routing a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingOutcome {
    /// Handed to a live stream of the recipient
    Delivered,
    /// Queued for storage in the recipient's offline queue
    Archived,
    /// Not deliverable and not archivable; the sender got service-unavailable
    Refused,
}

/// Registry of bound client streams.
///
/// Thread-safe registry that maps full JIDs to streams.
/// Uses DashMap for concurrent access without explicit locking.
pub struct StreamRegistry {
    storage: Arc<dyn Storage>,
    streams: DashMap<FullJid, Arc<C2sStream>>,
}

impl StreamRegistry {
    /// Create an empty registry.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        info!("Creating stream registry");
        Self {
            storage,
            streams: DashMap::new(),
        }
    }

    /// Bind `stream` and replay its stored messages through `offline`.
    ///
    /// The stream must carry a full JID. A stream already bound to the same
    /// JID is replaced and disconnected.
    #[instrument(skip_all, fields(stream_id = %stream.id()))]
    pub async fn bind(
        &self,
        stream: &Arc<C2sStream>,
        offline: &Offline,
    ) -> Result<FullJid, XmppError> {
        let jid = stream.mark_bound()?;
        if let Some(previous) = self.streams.insert(jid.clone(), Arc::clone(stream)) {
            if !Arc::ptr_eq(&previous, stream) {
                debug!(jid = %jid, "Replaced existing stream binding");
                previous.disconnect(Some(XmppError::stream("Replaced by new connection")));
            }
        } else {
            debug!(jid = %jid, "Bound stream");
        }
        metrics::record_bound_streams(self.streams.len() as i64);

        offline.deliver_offline_messages().await?;
        Ok(jid)
    }

    /// Remove `stream` and persist its last presence into the user record.
    #[instrument(skip_all, fields(stream_id = %stream.id()))]
    pub async fn unbind(&self, stream: &C2sStream) -> Result<(), XmppError> {
        let Some(jid) = stream.jid() else {
            return Ok(());
        };
        if self
            .streams
            .remove_if(&jid, |_, bound| bound.id() == stream.id())
            .is_none()
        {
            debug!(jid = %jid, "Stream was not bound");
            return Ok(());
        }
        metrics::record_bound_streams(self.streams.len() as i64);
        debug!(jid = %jid, "Unbound stream");

        let username = stream.username();
        let Some(mut user) = self.storage.fetch_user(&username).await? else {
            return Ok(());
        };
        let (presence, at) = match stream.presence_snapshot() {
            Some(snapshot) => snapshot,
            None => (unavailable_presence(&jid), Utc::now()),
        };
        user.last_presence = Some(presence);
        user.last_presence_at = Some(at);
        self.storage.insert_or_update_user(&user).await?;
        Ok(())
    }

    /// All bound streams of an account.
    pub fn user_streams(&self, username: &str) -> Vec<Arc<C2sStream>> {
        let mut streams: Vec<(String, Arc<C2sStream>)> = self
            .streams
            .iter()
            .filter(|entry| {
                entry
                    .key()
                    .node()
                    .map_or(false, |node| node.as_str() == username)
            })
            .map(|entry| (entry.key().to_string(), Arc::clone(entry.value())))
            .collect();
        streams.sort_by(|a, b| a.0.cmp(&b.0));
        streams.into_iter().map(|(_, stream)| stream).collect()
    }

    /// The live stream for `jid`.
    ///
    /// A full JID matches exactly; a bare JID picks the first bound resource.
    pub fn stream(&self, jid: &Jid) -> Option<Arc<C2sStream>> {
        let found = match jid.try_as_full() {
            Ok(full) => self.streams.get(full).map(|entry| Arc::clone(entry.value())),
            Err(bare) => {
                let mut candidates: Vec<(String, Arc<C2sStream>)> = self
                    .streams
                    .iter()
                    .filter(|entry| {
                        entry.key().to_bare() == *bare && !entry.value().is_disconnected()
                    })
                    .map(|entry| (entry.key().to_string(), Arc::clone(entry.value())))
                    .collect();
                candidates.sort_by(|a, b| a.0.cmp(&b.0));
                candidates.into_iter().next().map(|(_, stream)| stream)
            }
        };
        found.filter(|stream| !stream.is_disconnected())
    }

    /// Whether the account has at least one live bound stream.
    pub fn is_online(&self, username: &str) -> bool {
        self.streams.iter().any(|entry| {
            !entry.value().is_disconnected()
                && entry
                    .key()
                    .node()
                    .map_or(false, |node| node.as_str() == username)
        })
    }

    /// Number of bound streams.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Deliver `message` live, or hand it to the sender's offline engine.
    ///
    /// Messages that can be neither delivered nor archived are answered with
    /// `service-unavailable` on the sender's stream.
    #[instrument(skip_all, fields(to = message.attr("to").unwrap_or_default()))]
    pub async fn route_message(
        &self,
        message: Element,
        sender_offline: &Offline,
    ) -> Result<RoutingOutcome, XmppError> {
        let to = stanza::jid_attr(&message, "to")?
            .ok_or_else(|| XmppError::bad_request(Some("Message has no recipient".to_string())))?;

        if let Some(stream) = self.stream(&to) {
            if stream.send_element(message.clone()) {
                debug!("Message delivered live");
                return Ok(RoutingOutcome::Delivered);
            }
        }

        if offline::is_archivable(&message) {
            sender_offline.archive_message(message).await?;
            return Ok(RoutingOutcome::Archived);
        }

        debug!("Recipient unavailable, refusing message");
        sender_offline
            .reply_error(&message, StanzaErrorCondition::ServiceUnavailable)
            .await;
        Ok(RoutingOutcome::Refused)
    }
}

fn unavailable_presence(jid: &FullJid) -> Element {
    Element::builder("presence", ns::JABBER_CLIENT)
        .attr("from", jid.to_string())
        .attr("type", "unavailable".to_string())
        .build()
}
