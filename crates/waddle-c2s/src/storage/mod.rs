//! Storage abstraction for the session and delivery core.
//!
//! [`Storage`] is the only state shared across streams: every cross-session
//! interaction (offline queues, rosters, private XML, accounts) flows through
//! it. Implementations must:
//!
//! - run each mutation under exclusive access scoped to a single map/key update,
//! - run reads under shared access,
//! - never hold a lock across an `.await` beyond that unit of work,
//! - answer [`Storage::count_offline_messages`] without materializing the queue.
//!
//! Absence is reported as `None`/empty, never as an error. Errors mean the
//! backend faulted.
//!
//! [`MemoryStorage`] is the reference backend. Exactly one backend instance is
//! created by whoever assembles the process and injected as `Arc<dyn Storage>`.

mod memory;
mod model;

pub use memory::MemoryStorage;
pub use model::{RosterItem, RosterNotification, Subscription, User};

use async_trait::async_trait;
use minidom::Element;
use thiserror::Error;

/// Storage backend errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Sentinel returned by every operation while fault injection is active.
    #[error("storage: mocked error")]
    Mocked,

    /// Backend failure (I/O, poisoned lock, ...)
    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl StorageError {
    /// Create a new backend error.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

/// Persistence boundary consumed by streams and modules.
#[async_trait]
pub trait Storage: Send + Sync {
    // =========================================================================
    // Accounts
    // =========================================================================

    /// Insert a user, replacing any existing record with the same username.
    async fn insert_or_update_user(&self, user: &User) -> Result<(), StorageError>;

    /// Delete a user. Deleting an unknown user is not an error.
    async fn delete_user(&self, username: &str) -> Result<(), StorageError>;

    /// Fetch a user by username.
    async fn fetch_user(&self, username: &str) -> Result<Option<User>, StorageError>;

    /// Check whether a user exists.
    async fn user_exists(&self, username: &str) -> Result<bool, StorageError>;

    // =========================================================================
    // Offline queues
    // =========================================================================

    /// Append a message to the user's offline queue.
    async fn insert_offline_message(
        &self,
        message: &Element,
        username: &str,
    ) -> Result<(), StorageError>;

    /// Current length of the user's offline queue.
    async fn count_offline_messages(&self, username: &str) -> Result<usize, StorageError>;

    /// The user's offline queue in arrival order, without consuming it.
    async fn fetch_offline_messages(&self, username: &str) -> Result<Vec<Element>, StorageError>;

    /// Clear the user's offline queue.
    async fn delete_offline_messages(&self, username: &str) -> Result<(), StorageError>;

    // =========================================================================
    // Private XML (XEP-0049)
    // =========================================================================

    /// Replace the whole fragment set stored for `(username, namespace)`.
    async fn insert_or_update_private_xml(
        &self,
        fragments: &[Element],
        namespace: &str,
        username: &str,
    ) -> Result<(), StorageError>;

    /// Fetch the fragment set stored for `(username, namespace)`.
    async fn fetch_private_xml(
        &self,
        namespace: &str,
        username: &str,
    ) -> Result<Option<Vec<Element>>, StorageError>;

    // =========================================================================
    // Roster
    // =========================================================================

    /// Upsert a roster item, returning the user's new roster version.
    async fn insert_or_update_roster_item(&self, item: &RosterItem) -> Result<u64, StorageError>;

    /// Delete a roster item, returning the user's roster version afterwards.
    async fn delete_roster_item(&self, username: &str, jid: &str) -> Result<u64, StorageError>;

    /// All roster items of a user ordered by contact JID, plus the roster version.
    async fn fetch_roster_items(
        &self,
        username: &str,
    ) -> Result<(Vec<RosterItem>, u64), StorageError>;

    /// A single roster item.
    async fn fetch_roster_item(
        &self,
        username: &str,
        jid: &str,
    ) -> Result<Option<RosterItem>, StorageError>;

    /// Upsert a pending subscription notification.
    async fn insert_or_update_roster_notification(
        &self,
        notification: &RosterNotification,
    ) -> Result<(), StorageError>;

    /// Delete a pending subscription notification.
    async fn delete_roster_notification(
        &self,
        contact: &str,
        jid: &str,
    ) -> Result<(), StorageError>;

    /// Pending notifications for `contact`, ordered lexicographically by JID.
    async fn fetch_roster_notifications(
        &self,
        contact: &str,
    ) -> Result<Vec<RosterNotification>, StorageError>;
}
