//! XMPP Extension Protocols (XEPs) Implementation
//!
//! Stream-scoped IQ modules built on [`IqModule`](crate::module::IqModule).
//!
//! ## Implemented XEPs
//!
//! - **XEP-0012**: Last Activity - Server uptime and contact idle time.
//! - **XEP-0049**: Private XML Storage - Per-user XML fragments keyed by
//!   namespace.
//! - **XEP-0077**: In-Band Registration - Account creation, password change
//!   and cancellation over the stream.

pub mod xep0012;
pub mod xep0049;
pub mod xep0077;

pub use xep0012::{LastActivity, NS_LAST};
pub use xep0049::{is_valid_namespace, PrivateStorage, NS_PRIVATE};
pub use xep0077::{Registration, NS_REGISTER};
