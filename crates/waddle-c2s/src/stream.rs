//! Client-to-server stream (session) abstraction.
//!
//! A [`C2sStream`] represents one connected identity. It is owned by the
//! connection lifecycle and shared with modules through `Arc`/`Weak`. Every
//! accessor and mutator takes `&self` and is safe to call from any task.
//!
//! The transport side of the stream drains the bounded outbound sink through
//! the [`OutboundReceiver`] returned by [`C2sStream::new`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::StreamConfig;
use crate::XmppError;

/// Primary lifecycle progression of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Accepted, not yet bound to a full JID.
    Connecting,
    /// Bound to a full JID and eligible for stanza delivery.
    Bound,
    /// Terminal.
    Disconnected,
}

#[derive(Debug, Default)]
struct Identity {
    username: String,
    domain: String,
    resource: String,
}

#[derive(Debug, Default)]
struct PresenceState {
    element: Option<Element>,
    captured_at: Option<DateTime<Utc>>,
}

/// Generate a fresh stream identifier.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// One connected client session.
#[derive(Debug)]
pub struct C2sStream {
    id: String,
    identity: RwLock<Identity>,
    authenticated: AtomicBool,
    secured: AtomicBool,
    compressed: AtomicBool,
    bound: AtomicBool,
    connected: AtomicBool,
    presence: Mutex<PresenceState>,
    sender: mpsc::Sender<Element>,
    cancel: CancellationToken,
}

impl C2sStream {
    /// Create a stream for a freshly accepted connection.
    ///
    /// `jid` seeds the identity; a domain-only JID is typical before
    /// authentication. The returned receiver is the transport side of the
    /// outbound sink, bounded by `config.outbound_capacity`.
    pub fn new(
        id: impl Into<String>,
        jid: &Jid,
        config: &StreamConfig,
    ) -> (Arc<Self>, OutboundReceiver) {
        let (sender, receiver) = mpsc::channel(config.outbound_capacity);
        let identity = Identity {
            username: jid.node().map(|n| n.as_str().to_string()).unwrap_or_default(),
            domain: jid.domain().as_str().to_string(),
            resource: jid
                .resource()
                .map(|r| r.as_str().to_string())
                .unwrap_or_default(),
        };
        let stream = Arc::new(Self {
            id: id.into(),
            identity: RwLock::new(identity),
            authenticated: AtomicBool::new(false),
            secured: AtomicBool::new(false),
            compressed: AtomicBool::new(false),
            bound: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            presence: Mutex::new(PresenceState::default()),
            sender,
            cancel: CancellationToken::new(),
        });
        debug!(stream_id = %stream.id, jid = %jid, "Created stream");
        (stream, OutboundReceiver { receiver })
    }

    // =========================================================================
    // Identity
    // =========================================================================

    /// Stream identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Account name, empty until authenticated.
    pub fn username(&self) -> String {
        self.read_identity(|i| i.username.clone())
    }

    /// Served domain.
    pub fn domain(&self) -> String {
        self.read_identity(|i| i.domain.clone())
    }

    /// Connection resource, empty until bound.
    pub fn resource(&self) -> String {
        self.read_identity(|i| i.resource.clone())
    }

    /// Full JID, available once username and resource are known.
    pub fn jid(&self) -> Option<FullJid> {
        self.read_identity(|i| {
            if i.username.is_empty() || i.resource.is_empty() {
                return None;
            }
            format!("{}@{}/{}", i.username, i.domain, i.resource)
                .parse::<FullJid>()
                .ok()
        })
    }

    /// Bare JID of the account, or the domain before authentication.
    pub fn bare_jid(&self) -> Option<BareJid> {
        self.read_identity(|i| {
            let raw = if i.username.is_empty() {
                i.domain.clone()
            } else {
                format!("{}@{}", i.username, i.domain)
            };
            raw.parse::<BareJid>().ok()
        })
    }

    /// Set the account name (SASL success).
    pub fn set_username(&self, username: impl Into<String>) {
        let username = username.into();
        self.write_identity(|i| i.username = username);
    }

    /// Set the served domain.
    pub fn set_domain(&self, domain: impl Into<String>) {
        let domain = domain.into();
        self.write_identity(|i| i.domain = domain);
    }

    /// Set the connection resource (resource binding).
    pub fn set_resource(&self, resource: impl Into<String>) {
        let resource = resource.into();
        self.write_identity(|i| i.resource = resource);
    }

    /// Replace the whole identity with the parts of a full JID.
    pub fn set_jid(&self, jid: &FullJid) {
        let username = jid.node().map(|n| n.as_str().to_string()).unwrap_or_default();
        let domain = jid.domain().as_str().to_string();
        let resource = jid.resource().as_str().to_string();
        self.write_identity(|i| {
            i.username = username;
            i.domain = domain;
            i.resource = resource;
        });
    }

    fn read_identity<R>(&self, f: impl FnOnce(&Identity) -> R) -> R {
        let guard = self.identity.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write_identity(&self, f: impl FnOnce(&mut Identity)) {
        let mut guard = self
            .identity
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }

    // =========================================================================
    // Flags
    // =========================================================================

    /// Whether SASL authentication succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Whether the transport is encrypted.
    pub fn is_secured(&self) -> bool {
        self.secured.load(Ordering::SeqCst)
    }

    /// Whether stream compression is active.
    pub fn is_compressed(&self) -> bool {
        self.compressed.load(Ordering::SeqCst)
    }

    /// Whether the stream reached its terminal state.
    pub fn is_disconnected(&self) -> bool {
        !self.connected.load(Ordering::SeqCst)
    }

    /// Whether the stream has been bound to a full JID.
    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::SeqCst)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        if self.is_disconnected() {
            StreamState::Disconnected
        } else if self.is_bound() {
            StreamState::Bound
        } else {
            StreamState::Connecting
        }
    }

    /// Mark the stream as authenticated. `false` never clears the flag.
    pub fn set_authenticated(&self, authenticated: bool) {
        if authenticated {
            self.authenticated.store(true, Ordering::SeqCst);
        }
    }

    /// Mark the stream as secured. `false` never clears the flag.
    pub fn set_secured(&self, secured: bool) {
        if secured {
            self.secured.store(true, Ordering::SeqCst);
        }
    }

    /// Mark the stream as compressed. `false` never clears the flag.
    pub fn set_compressed(&self, compressed: bool) {
        if compressed {
            self.compressed.store(true, Ordering::SeqCst);
        }
    }

    /// Transition to [`StreamState::Bound`].
    ///
    /// Fails unless the identity forms a full JID and the stream is still
    /// connected.
    pub fn mark_bound(&self) -> Result<FullJid, XmppError> {
        if self.is_disconnected() {
            return Err(XmppError::stream("Cannot bind a disconnected stream"));
        }
        let jid = self
            .jid()
            .ok_or_else(|| XmppError::stream("Cannot bind a stream without a full JID"))?;
        self.bound.store(true, Ordering::SeqCst);
        Ok(jid)
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Queue an element for transmission without waiting.
    ///
    /// Returns `false` if the element was not handed off: the stream is
    /// disconnected, or the sink is closed or full.
    pub fn send_element(&self, element: Element) -> bool {
        if self.is_disconnected() {
            debug!(stream_id = %self.id, "Dropping element for disconnected stream");
            return false;
        }
        match self.sender.try_send(element) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(stream_id = %self.id, "Outbound channel full, applying backpressure");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(stream_id = %self.id, "Outbound channel closed");
                false
            }
        }
    }

    /// Queue an element, waiting for sink capacity.
    ///
    /// Gives up as soon as the stream is disconnected. Returns whether the
    /// element was handed off.
    pub async fn deliver_element(&self, element: Element) -> bool {
        if self.is_disconnected() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.sender.send(element) => sent.is_ok(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Terminate the stream. Only the first call has an effect.
    #[instrument(skip(self, reason), fields(stream_id = %self.id))]
    pub fn disconnect(&self, reason: Option<XmppError>) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        match reason {
            Some(err) => info!(error = %err, "Stream disconnected"),
            None => info!("Stream disconnected"),
        }
        self.cancel.cancel();
    }

    /// Token cancelled when the stream disconnects.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves once the stream disconnects.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    // =========================================================================
    // Presence
    // =========================================================================

    /// Last presence received on this stream.
    pub fn presence(&self) -> Option<Element> {
        self.lock_presence().element.clone()
    }

    /// When the last presence was captured.
    pub fn presence_at(&self) -> Option<DateTime<Utc>> {
        self.lock_presence().captured_at
    }

    /// Last presence and its capture time, read together.
    pub fn presence_snapshot(&self) -> Option<(Element, DateTime<Utc>)> {
        let state = self.lock_presence();
        match (&state.element, state.captured_at) {
            (Some(element), Some(at)) => Some((element.clone(), at)),
            _ => None,
        }
    }

    /// Store a presence stanza together with the current time.
    pub fn set_presence(&self, presence: Element) {
        let mut state = self.lock_presence();
        state.element = Some(presence);
        state.captured_at = Some(Utc::now());
    }

    fn lock_presence(&self) -> std::sync::MutexGuard<'_, PresenceState> {
        self.presence.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Transport side of a stream's outbound sink.
#[derive(Debug)]
pub struct OutboundReceiver {
    receiver: mpsc::Receiver<Element>,
}

impl OutboundReceiver {
    /// Wait for the next outbound element. `None` once the stream is dropped.
    pub async fn recv(&mut self) -> Option<Element> {
        self.receiver.recv().await
    }

    /// Take the next outbound element if one is queued.
    pub fn try_recv(&mut self) -> Option<Element> {
        self.receiver.try_recv().ok()
    }

    /// Wait up to `timeout` for the next outbound element.
    pub async fn fetch_element(&mut self, timeout: Duration) -> Option<Element> {
        tokio::time::timeout(timeout, self.receiver.recv())
            .await
            .ok()
            .flatten()
    }
}
