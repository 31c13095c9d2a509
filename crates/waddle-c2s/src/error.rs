//! Error types for the session and delivery core.

use std::str::FromStr;

use thiserror::Error;

use crate::storage::StorageError;

/// Core errors.
#[derive(Debug, Error)]
pub enum XmppError {
    /// Stream lifecycle error (disconnect reasons, closed sinks)
    #[error("Stream error: {0}")]
    Stream(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error (stopped workers, broken invariants)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Storage backend fault
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Stanza error (for IQ and message error replies)
    #[error("Stanza error: {condition}")]
    Stanza {
        /// Error condition
        condition: StanzaErrorCondition,
        /// Error type
        error_type: StanzaErrorType,
        /// Optional text description
        text: Option<String>,
    },
}

impl XmppError {
    /// Create a new stream error.
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a stanza error with the default type for `condition`.
    pub fn stanza(condition: StanzaErrorCondition, text: Option<String>) -> Self {
        Self::Stanza {
            condition,
            error_type: condition.default_type(),
            text,
        }
    }

    /// Create a stanza error for 'bad-request'.
    pub fn bad_request(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::BadRequest, text)
    }

    /// Create a stanza error for 'forbidden'.
    pub fn forbidden(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::Forbidden, text)
    }

    /// Create a stanza error for 'not-acceptable'.
    pub fn not_acceptable(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::NotAcceptable, text)
    }

    /// Create a stanza error for 'service-unavailable'.
    pub fn service_unavailable(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::ServiceUnavailable, text)
    }

    /// The stanza error condition a requester should see for this error.
    ///
    /// Anything that is not already a stanza error is reported as
    /// `internal-server-error`.
    pub fn condition(&self) -> StanzaErrorCondition {
        match self {
            Self::Stanza { condition, .. } => *condition,
            _ => StanzaErrorCondition::InternalServerError,
        }
    }
}

/// XMPP stanza error conditions (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaErrorCondition {
    /// Bad request (malformed payload, missing field)
    BadRequest,
    /// Conflict (e.g., account already exists)
    Conflict,
    /// Feature not implemented
    FeatureNotImplemented,
    /// Forbidden (permission denied, wrong addressing)
    Forbidden,
    /// Internal server error
    InternalServerError,
    /// Item not found
    ItemNotFound,
    /// JID malformed
    JidMalformed,
    /// Not acceptable
    NotAcceptable,
    /// Not allowed
    NotAllowed,
    /// Not authorized
    NotAuthorized,
    /// Resource constraint
    ResourceConstraint,
    /// Service unavailable
    ServiceUnavailable,
    /// Undefined condition
    UndefinedCondition,
}

impl StanzaErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::ResourceConstraint => "resource-constraint",
            Self::ServiceUnavailable => "service-unavailable",
            Self::UndefinedCondition => "undefined-condition",
        }
    }

    /// The error type RFC 6120 suggests for this condition.
    pub fn default_type(&self) -> StanzaErrorType {
        match self {
            Self::BadRequest | Self::JidMalformed | Self::NotAcceptable => {
                StanzaErrorType::Modify
            }
            Self::Forbidden | Self::NotAuthorized => StanzaErrorType::Auth,
            Self::InternalServerError | Self::ResourceConstraint => StanzaErrorType::Wait,
            Self::Conflict
            | Self::FeatureNotImplemented
            | Self::ItemNotFound
            | Self::NotAllowed
            | Self::ServiceUnavailable
            | Self::UndefinedCondition => StanzaErrorType::Cancel,
        }
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StanzaErrorCondition {
    type Err = XmppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let condition = match s {
            "bad-request" => Self::BadRequest,
            "conflict" => Self::Conflict,
            "feature-not-implemented" => Self::FeatureNotImplemented,
            "forbidden" => Self::Forbidden,
            "internal-server-error" => Self::InternalServerError,
            "item-not-found" => Self::ItemNotFound,
            "jid-malformed" => Self::JidMalformed,
            "not-acceptable" => Self::NotAcceptable,
            "not-allowed" => Self::NotAllowed,
            "not-authorized" => Self::NotAuthorized,
            "resource-constraint" => Self::ResourceConstraint,
            "service-unavailable" => Self::ServiceUnavailable,
            "undefined-condition" => Self::UndefinedCondition,
            other => {
                return Err(XmppError::internal(format!(
                    "Unknown stanza error condition: {}",
                    other
                )))
            }
        };
        Ok(condition)
    }
}

/// XMPP stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry (unrecoverable error)
    Cancel,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting (temporary error)
    Wait,
}

impl StanzaErrorType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
