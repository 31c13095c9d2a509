//! In-memory reference implementation of [`Storage`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use minidom::Element;

use super::{RosterItem, RosterNotification, Storage, StorageError, User};

#[derive(Debug, Default)]
struct UserRoster {
    ver: u64,
    items: BTreeMap<String, RosterItem>,
}

/// In-memory storage backend.
///
/// Each collection sits behind its own `RwLock`, so an offline append for one
/// user never contends with a roster read for another beyond a single map
/// update. Ordered collections use `BTreeMap` keyed by JID so that fetches
/// are reproducible.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    users: RwLock<HashMap<String, User>>,
    offline_messages: RwLock<HashMap<String, Vec<Element>>>,
    private_xml: RwLock<HashMap<(String, String), Vec<Element>>>,
    rosters: RwLock<HashMap<String, UserRoster>>,
    roster_notifications: RwLock<HashMap<String, BTreeMap<String, RosterNotification>>>,
    mocked_error: AtomicBool,
}

impl MemoryStorage {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with [`StorageError::Mocked`].
    #[cfg(any(test, feature = "test-util"))]
    pub fn activate_mocked_error(&self) {
        tracing::debug!("Storage fault injection activated");
        self.mocked_error.store(true, Ordering::SeqCst);
    }

    /// Restore normal operation after [`activate_mocked_error`](Self::activate_mocked_error).
    #[cfg(any(test, feature = "test-util"))]
    pub fn deactivate_mocked_error(&self) {
        tracing::debug!("Storage fault injection deactivated");
        self.mocked_error.store(false, Ordering::SeqCst);
    }

    fn check_mocked(&self) -> Result<(), StorageError> {
        if self.mocked_error.load(Ordering::SeqCst) {
            return Err(StorageError::Mocked);
        }
        Ok(())
    }

    fn in_read_lock<T, R>(
        &self,
        lock: &RwLock<T>,
        f: impl FnOnce(&T) -> R,
    ) -> Result<R, StorageError> {
        self.check_mocked()?;
        let guard = lock
            .read()
            .map_err(|_| StorageError::backend("Lock poisoned"))?;
        Ok(f(&guard))
    }

    fn in_write_lock<T, R>(
        &self,
        lock: &RwLock<T>,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, StorageError> {
        self.check_mocked()?;
        let mut guard = lock
            .write()
            .map_err(|_| StorageError::backend("Lock poisoned"))?;
        Ok(f(&mut guard))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn insert_or_update_user(&self, user: &User) -> Result<(), StorageError> {
        self.in_write_lock(&self.users, |users| {
            users.insert(user.username.clone(), user.clone());
        })
    }

    async fn delete_user(&self, username: &str) -> Result<(), StorageError> {
        self.in_write_lock(&self.users, |users| {
            users.remove(username);
        })
    }

    async fn fetch_user(&self, username: &str) -> Result<Option<User>, StorageError> {
        self.in_read_lock(&self.users, |users| users.get(username).cloned())
    }

    async fn user_exists(&self, username: &str) -> Result<bool, StorageError> {
        self.in_read_lock(&self.users, |users| users.contains_key(username))
    }

    async fn insert_offline_message(
        &self,
        message: &Element,
        username: &str,
    ) -> Result<(), StorageError> {
        self.in_write_lock(&self.offline_messages, |queues| {
            queues
                .entry(username.to_string())
                .or_default()
                .push(message.clone());
        })
    }

    async fn count_offline_messages(&self, username: &str) -> Result<usize, StorageError> {
        self.in_read_lock(&self.offline_messages, |queues| {
            queues.get(username).map_or(0, Vec::len)
        })
    }

    async fn fetch_offline_messages(&self, username: &str) -> Result<Vec<Element>, StorageError> {
        self.in_read_lock(&self.offline_messages, |queues| {
            queues.get(username).cloned().unwrap_or_default()
        })
    }

    async fn delete_offline_messages(&self, username: &str) -> Result<(), StorageError> {
        self.in_write_lock(&self.offline_messages, |queues| {
            queues.remove(username);
        })
    }

    async fn insert_or_update_private_xml(
        &self,
        fragments: &[Element],
        namespace: &str,
        username: &str,
    ) -> Result<(), StorageError> {
        self.in_write_lock(&self.private_xml, |store| {
            store.insert(
                (username.to_string(), namespace.to_string()),
                fragments.to_vec(),
            );
        })
    }

    async fn fetch_private_xml(
        &self,
        namespace: &str,
        username: &str,
    ) -> Result<Option<Vec<Element>>, StorageError> {
        self.in_read_lock(&self.private_xml, |store| {
            store
                .get(&(username.to_string(), namespace.to_string()))
                .cloned()
        })
    }

    async fn insert_or_update_roster_item(&self, item: &RosterItem) -> Result<u64, StorageError> {
        self.in_write_lock(&self.rosters, |rosters| {
            let roster = rosters.entry(item.username.clone()).or_default();
            roster.ver += 1;
            let mut stored = item.clone();
            stored.ver = roster.ver;
            roster.items.insert(stored.jid.clone(), stored);
            roster.ver
        })
    }

    async fn delete_roster_item(&self, username: &str, jid: &str) -> Result<u64, StorageError> {
        self.in_write_lock(&self.rosters, |rosters| match rosters.get_mut(username) {
            Some(roster) => {
                if roster.items.remove(jid).is_some() {
                    roster.ver += 1;
                }
                roster.ver
            }
            None => 0,
        })
    }

    async fn fetch_roster_items(
        &self,
        username: &str,
    ) -> Result<(Vec<RosterItem>, u64), StorageError> {
        self.in_read_lock(&self.rosters, |rosters| match rosters.get(username) {
            Some(roster) => (roster.items.values().cloned().collect(), roster.ver),
            None => (Vec::new(), 0),
        })
    }

    async fn fetch_roster_item(
        &self,
        username: &str,
        jid: &str,
    ) -> Result<Option<RosterItem>, StorageError> {
        self.in_read_lock(&self.rosters, |rosters| {
            rosters
                .get(username)
                .and_then(|roster| roster.items.get(jid))
                .cloned()
        })
    }

    async fn insert_or_update_roster_notification(
        &self,
        notification: &RosterNotification,
    ) -> Result<(), StorageError> {
        self.in_write_lock(&self.roster_notifications, |notifications| {
            notifications
                .entry(notification.contact.clone())
                .or_default()
                .insert(notification.jid.clone(), notification.clone());
        })
    }

    async fn delete_roster_notification(
        &self,
        contact: &str,
        jid: &str,
    ) -> Result<(), StorageError> {
        self.in_write_lock(&self.roster_notifications, |notifications| {
            if let Some(pending) = notifications.get_mut(contact) {
                pending.remove(jid);
                if pending.is_empty() {
                    notifications.remove(contact);
                }
            }
        })
    }

    async fn fetch_roster_notifications(
        &self,
        contact: &str,
    ) -> Result<Vec<RosterNotification>, StorageError> {
        self.in_read_lock(&self.roster_notifications, |notifications| {
            notifications
                .get(contact)
                .map(|pending| pending.values().cloned().collect())
                .unwrap_or_default()
        })
    }
}
