//! Records persisted through [`Storage`](super::Storage).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use minidom::Element;
use serde::{Deserialize, Serialize};

use crate::XmppError;

/// A registered account.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    /// Account name (local part of the JID), unique.
    pub username: String,
    /// Account credential.
    pub password: String,
    /// Last presence stanza seen before the account went offline.
    pub last_presence: Option<Element>,
    /// When `last_presence` was captured.
    pub last_presence_at: Option<DateTime<Utc>>,
}

impl User {
    /// Create a user with no presence history.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            last_presence: None,
            last_presence_at: None,
        }
    }

    /// Text of the `<status/>` child of the last presence, if any.
    pub fn last_status(&self) -> Option<String> {
        self.last_presence
            .as_ref()?
            .children()
            .find(|c| c.name() == "status")
            .map(|s| s.text())
    }
}

/// Subscription state for a roster item (RFC 6121 Section 2.1.2.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Subscription {
    /// No subscription exists between user and contact.
    #[default]
    None,
    /// User receives the contact's presence.
    To,
    /// Contact receives the user's presence.
    From,
    /// Mutual subscription.
    Both,
}

impl Subscription {
    /// Get the XML attribute value for this subscription state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::To => "to",
            Subscription::From => "from",
            Subscription::Both => "both",
        }
    }

    /// Whether the user is allowed to see the contact's presence.
    pub fn receives_presence(&self) -> bool {
        matches!(self, Subscription::To | Subscription::Both)
    }
}

impl FromStr for Subscription {
    type Err = XmppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Subscription::None),
            "to" => Ok(Subscription::To),
            "from" => Ok(Subscription::From),
            "both" => Ok(Subscription::Both),
            _ => Err(XmppError::bad_request(Some(format!(
                "Invalid subscription state: {}",
                s
            )))),
        }
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A contact in a user's roster, keyed by `(username, jid)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterItem {
    /// Owner of the roster.
    pub username: String,
    /// Contact bare JID.
    pub jid: String,
    /// Optional human-readable name for the contact.
    pub name: Option<String>,
    /// Current subscription state.
    pub subscription: Subscription,
    /// Whether a subscription request is pending.
    pub ask: bool,
    /// Roster version at which this item was last written.
    pub ver: u64,
    /// Groups this contact belongs to.
    pub groups: Vec<String>,
}

impl RosterItem {
    /// Create a new roster item with minimal information.
    pub fn new(username: impl Into<String>, jid: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            jid: jid.into(),
            name: None,
            subscription: Subscription::None,
            ask: false,
            ver: 0,
            groups: Vec::new(),
        }
    }

    /// Set the subscription state.
    pub fn set_subscription(mut self, subscription: Subscription) -> Self {
        self.subscription = subscription;
        self
    }

    /// Add a group.
    pub fn add_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }
}

/// A pending subscription request waiting for `contact` to answer it.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterNotification {
    /// Account that has to answer the request.
    pub contact: String,
    /// Bare JID of the requester.
    pub jid: String,
    /// The original subscription presence.
    pub presence: Element,
}
