//! # waddle-c2s
//!
//! Session and delivery core of the Waddle XMPP server.
//!
//! ## Architecture
//!
//! - **Streams**: [`C2sStream`] holds the identity, flags, last presence and
//!   bounded outbound sink of one client connection
//! - **Actors**: stateful modules serialize their requests through an
//!   [`Actor`] bound to the owning stream's cancellation token
//! - **Offline delivery**: [`OfflineQueues`] archives mail for offline
//!   accounts with per-account admission control, and [`Offline`] replays it
//!   when the account binds a resource
//! - **Storage**: every cross-session interaction goes through the injected
//!   [`Storage`] backend; [`MemoryStorage`] is the reference implementation
//!
//! ## XEP Support
//!
//! - XEP-0012 (Last Activity)
//! - XEP-0049 (Private XML Storage)
//! - XEP-0077 (In-Band Registration)
//! - XEP-0160 (Best Practices for Handling Offline Messages)
//! - XEP-0203 (Delayed Delivery)

pub mod actor;
pub mod config;
pub mod disco;
pub mod metrics;
pub mod module;
pub mod offline;
pub mod registry;
pub mod stanza;
pub mod storage;
pub mod stream;
pub mod telemetry;
pub mod xep;

mod error;

pub use actor::Actor;
pub use config::{load_config_from_str, C2sConfig, ConfigError};
pub use disco::DiscoInfo;
pub use error::{StanzaErrorCondition, StanzaErrorType, XmppError};
pub use module::IqModule;
pub use offline::{Offline, OfflineQueues};
pub use registry::{RoutingOutcome, StreamRegistry};
pub use storage::{MemoryStorage, Storage, StorageError};
pub use stream::{C2sStream, OutboundReceiver, StreamState};
