//! IQ module capability shared by feature modules.

use async_trait::async_trait;
use minidom::Element;
use tracing::{debug, error};

use crate::disco::DiscoInfo;
use crate::{metrics, stanza, XmppError};

/// A feature module handling a family of IQ requests.
///
/// The router asks every module whether it [matches](IqModule::matches_iq) an
/// incoming IQ and hands it to exactly one of them. `process_iq` returns once
/// the request is accepted; the reply is sent later through the requester's
/// stream.
#[async_trait]
pub trait IqModule: Send + Sync {
    /// Announce the module's features.
    fn register_disco(&self, disco: &DiscoInfo);

    /// Whether this module handles `iq`.
    fn matches_iq(&self, iq: &Element) -> bool;

    /// Accept `iq` for processing.
    async fn process_iq(&self, iq: Element);
}

/// Turn the outcome of processing `iq` into the element sent back.
///
/// Storage faults are logged, counted and reported as
/// `internal-server-error`; any other error carries its own condition.
pub(crate) fn reply_or_error(
    module: &'static str,
    iq: &Element,
    outcome: Result<Element, XmppError>,
) -> Element {
    match outcome {
        Ok(reply) => reply,
        Err(err) => {
            if matches!(err, XmppError::Storage(_)) {
                error!(module, error = %err, "Storage fault while processing IQ");
                metrics::record_storage_fault(module);
            } else {
                debug!(module, error = %err, "Rejecting IQ");
            }
            stanza::error_reply(iq, err.condition())
        }
    }
}
