//! Offline message store-and-forward (XEP-0160).
//!
//! Messages for accounts without a live session are appended to the
//! account's offline queue, bounded by `offline.queue_size`, and replayed in
//! arrival order once the account binds a new session.
//!
//! Two pieces cooperate:
//!
//! - [`OfflineQueues`] is shared by the whole process. It owns the storage
//!   handle, the queue capacity and a per-recipient async lock that
//!   linearizes every count/append/fetch/delete sequence for one account.
//! - [`Offline`] is created per stream. It runs its work on the stream's own
//!   [`Actor`], so submission never waits on storage, and replies to the
//!   stream it belongs to.
//!
//! The backlog is cleared only after every stored message was handed to the
//! stream. A delivery cut short by a disconnect leaves the whole backlog in
//! place, so a later session may see some messages twice.

use std::sync::{Arc, Weak};

use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use minidom::{Element, Node};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::actor::Actor;
use crate::config::OfflineConfig;
use crate::disco::DiscoInfo;
use crate::stanza::{self, ns};
use crate::storage::Storage;
use crate::stream::C2sStream;
use crate::{metrics, StanzaErrorCondition, XmppError};

/// Feature advertised for offline storage.
pub const NS_OFFLINE: &str = "msgoffline";

const DELAY_REASON: &str = "Offline Storage";

/// Process-wide offline queue state.
pub struct OfflineQueues {
    queue_size: usize,
    storage: Arc<dyn Storage>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl OfflineQueues {
    /// Create the shared queue state.
    pub fn new(config: &OfflineConfig, storage: Arc<dyn Storage>) -> Self {
        Self {
            queue_size: config.queue_size,
            storage,
            locks: DashMap::new(),
        }
    }

    /// Maximum number of stored messages per account.
    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    /// Storage backend holding the queues.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    async fn lock(&self, username: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(username.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    fn release(&self, username: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        self.locks
            .remove_if(username, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Count, then append, under the recipient lock.
    async fn admit(&self, username: &str, message: Element) -> Result<usize, XmppError> {
        let guard = self.lock(username).await;
        let result = self.admit_locked(username, message).await;
        self.release(username, guard);
        result
    }

    async fn admit_locked(&self, username: &str, message: Element) -> Result<usize, XmppError> {
        let count = self.storage.count_offline_messages(username).await?;
        if count >= self.queue_size {
            return Err(XmppError::service_unavailable(Some(format!(
                "Offline queue for {} is full",
                username
            ))));
        }
        self.storage.insert_offline_message(&message, username).await?;
        Ok(count + 1)
    }

    /// Fetch, hand off, then delete under the recipient lock.
    async fn drain(&self, username: &str, stream: &C2sStream) -> Result<usize, XmppError> {
        let guard = self.lock(username).await;
        let result = self.drain_locked(username, stream).await;
        self.release(username, guard);
        result
    }

    async fn drain_locked(&self, username: &str, stream: &C2sStream) -> Result<usize, XmppError> {
        let messages = self.storage.fetch_offline_messages(username).await?;
        if messages.is_empty() {
            return Ok(0);
        }
        let total = messages.len();
        for (handed_off, message) in messages.into_iter().enumerate() {
            if !stream.deliver_element(message).await {
                warn!(
                    username,
                    handed_off, total, "Offline delivery interrupted, keeping backlog"
                );
                return Err(XmppError::stream("Offline delivery interrupted"));
            }
        }
        self.storage.delete_offline_messages(username).await?;
        Ok(total)
    }
}

/// Per-stream offline engine.
pub struct Offline {
    inner: Arc<Inner>,
    actor: Actor,
}

struct Inner {
    queues: Arc<OfflineQueues>,
    stream: Weak<C2sStream>,
}

impl Offline {
    /// Create the engine for `stream`. Its worker stops when the stream
    /// disconnects.
    pub fn new(queues: Arc<OfflineQueues>, stream: &Arc<C2sStream>) -> Self {
        let actor = Actor::spawn(
            format!("offline:{}", stream.id()),
            stream.cancellation_token(),
        );
        Self {
            inner: Arc::new(Inner {
                queues,
                stream: Arc::downgrade(stream),
            }),
            actor,
        }
    }

    /// Announce offline storage on the server entity.
    pub fn register_disco(&self, disco: &DiscoInfo) {
        if let Some(stream) = self.inner.stream.upgrade() {
            disco.add_feature(&stream.domain(), None, NS_OFFLINE);
        }
    }

    /// Queue `message` for storage on behalf of this stream's user.
    ///
    /// Refusals and faults are reported to this stream as error replies.
    pub async fn archive_message(&self, message: Element) -> Result<(), XmppError> {
        let inner = Arc::clone(&self.inner);
        self.actor
            .submit(async move { inner.archive(message).await })
            .await
    }

    /// Queue replay of this stream's stored messages.
    pub async fn deliver_offline_messages(&self) -> Result<(), XmppError> {
        let inner = Arc::clone(&self.inner);
        self.actor.submit(async move { inner.deliver().await }).await
    }

    /// Wait until all previously queued work has run.
    pub async fn wait_idle(&self) -> Result<(), XmppError> {
        self.actor.barrier().await
    }

    /// Stream this engine belongs to, if it is still alive.
    pub fn stream(&self) -> Option<Arc<C2sStream>> {
        self.inner.stream.upgrade()
    }

    /// Send an error reply for `message` to this engine's stream.
    pub(crate) async fn reply_error(&self, message: &Element, condition: StanzaErrorCondition) {
        self.inner.reply_error(message, condition).await;
    }
}

impl Inner {
    async fn archive(&self, message: Element) {
        let (username, domain) = match recipient(&message) {
            Ok(parts) => parts,
            Err(err) => {
                debug!(error = %err, "Rejecting offline message");
                self.reply_error(&message, err.condition()).await;
                return;
            }
        };

        match self
            .queues
            .admit(&username, stamp_delay(&message, &domain))
            .await
        {
            Ok(count) => {
                metrics::record_offline_archived();
                debug!(username = %username, count, "Archived offline message");
            }
            Err(err @ XmppError::Storage(_)) => {
                error!(username = %username, error = %err, "Failed to archive offline message");
                metrics::record_storage_fault("offline");
                self.reply_error(&message, err.condition()).await;
            }
            Err(err) => {
                info!(username = %username, error = %err, "Offline message refused");
                metrics::record_offline_refused();
                self.reply_error(&message, err.condition()).await;
            }
        }
    }

    async fn deliver(&self) {
        let Some(stream) = self.stream.upgrade() else {
            return;
        };
        let username = stream.username();
        if username.is_empty() {
            debug!(stream_id = %stream.id(), "Skipping offline delivery for anonymous stream");
            return;
        }

        match self.queues.drain(&username, &stream).await {
            Ok(0) => {}
            Ok(count) => {
                metrics::record_offline_delivered(count as u64);
                info!(username = %username, count, "Delivered offline messages");
            }
            Err(err @ XmppError::Storage(_)) => {
                error!(username = %username, error = %err, "Failed to deliver offline messages");
                metrics::record_storage_fault("offline");
            }
            Err(err) => {
                debug!(username = %username, error = %err, "Offline delivery aborted");
            }
        }
    }

    async fn reply_error(&self, message: &Element, condition: StanzaErrorCondition) {
        match self.stream.upgrade() {
            Some(stream) => {
                stream
                    .deliver_element(stanza::error_reply(message, condition))
                    .await;
            }
            None => debug!(%condition, "Sender stream gone, dropping error reply"),
        }
    }
}

/// Whether a message is eligible for offline storage.
///
/// Normal messages always are; chat messages only when they carry a body.
pub fn is_archivable(message: &Element) -> bool {
    if message.name() != "message" {
        return false;
    }
    match message.attr("type") {
        None | Some("normal") => true,
        Some("chat") => message.children().any(|c| c.name() == "body"),
        _ => false,
    }
}

/// Resolve the recipient's account name and domain from `to`.
fn recipient(message: &Element) -> Result<(String, String), XmppError> {
    let to = stanza::jid_attr(message, "to")?
        .ok_or_else(|| XmppError::bad_request(Some("Message has no recipient".to_string())))?;
    let node = to.node().ok_or_else(|| {
        XmppError::bad_request(Some(format!("Recipient '{}' is not an account", to)))
    })?;
    Ok((node.as_str().to_string(), to.domain().as_str().to_string()))
}

/// Copy of `message` carrying a XEP-0203 delay stamp.
fn stamp_delay(message: &Element, from: &str) -> Element {
    let delay = Element::builder("delay", ns::DELAY)
        .attr("from", from.to_string())
        .attr(
            "stamp",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        )
        .append(Node::Text(DELAY_REASON.to_string()))
        .build();
    let mut stored = message.clone();
    stored.append_child(delay);
    stored
}
