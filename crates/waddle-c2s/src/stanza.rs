//! Stanza helpers over `minidom::Element`.
//!
//! Parsing and serialization of the XML stream are handled elsewhere. These
//! helpers only read addressing/type attributes and build the reply units the
//! core sends back through a stream.

use jid::Jid;
use minidom::{Element, ElementBuilder};

use crate::{StanzaErrorCondition, XmppError};

/// Namespace constants used by the core.
pub mod ns {
    /// XMPP client namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// Stanza error namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// XEP-0203 Delayed Delivery namespace
    pub const DELAY: &str = "urn:xmpp:delay";
}

/// IQ stanza types (RFC 6120 Section 8.2.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    /// Request for information
    Get,
    /// Request to change state
    Set,
    /// Successful response
    Result,
    /// Error response
    Error,
}

impl IqType {
    /// Read the type of an `<iq/>` element.
    ///
    /// Returns `None` for non-IQ elements or unknown type values.
    pub fn of(element: &Element) -> Option<Self> {
        if element.name() != "iq" {
            return None;
        }
        match element.attr("type")? {
            "get" => Some(Self::Get),
            "set" => Some(Self::Set),
            "result" => Some(Self::Result),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Result => "result",
            Self::Error => "error",
        }
    }
}

/// Check if an element is an IQ of the given type.
pub fn is_iq_type(element: &Element, iq_type: IqType) -> bool {
    IqType::of(element) == Some(iq_type)
}

/// Parse a JID-valued attribute.
///
/// A missing attribute is `Ok(None)`; a malformed one is `jid-malformed`.
pub fn jid_attr(element: &Element, name: &str) -> Result<Option<Jid>, XmppError> {
    match element.attr(name) {
        None => Ok(None),
        Some(value) => value.parse::<Jid>().map(Some).map_err(|e| {
            XmppError::stanza(
                StanzaErrorCondition::JidMalformed,
                Some(format!("Invalid '{}' address '{}': {}", name, value, e)),
            )
        }),
    }
}

/// Check if a JID addresses a server (no node and no resource).
pub fn is_server_jid(jid: &Jid) -> bool {
    jid.node().is_none() && jid.resource().is_none()
}

/// Check if a JID is the bare address of `username@domain`.
pub fn is_own_bare_jid(jid: &Jid, username: &str, domain: &str) -> bool {
    jid.resource().is_none()
        && jid.domain().as_str() == domain
        && jid.node().map(|n| n.as_str() == username).unwrap_or(false)
}

/// Start a reply to `stanza` with swapped addressing and the same id.
fn reply_builder(stanza: &Element, kind: &str) -> ElementBuilder {
    let mut builder =
        Element::builder(stanza.name(), ns::JABBER_CLIENT).attr("type", kind.to_string());
    if let Some(id) = stanza.attr("id") {
        builder = builder.attr("id", id.to_string());
    }
    if let Some(from) = stanza.attr("from") {
        builder = builder.attr("to", from.to_string());
    }
    if let Some(to) = stanza.attr("to") {
        builder = builder.attr("from", to.to_string());
    }
    builder
}

/// Build an empty `result` IQ answering `iq`.
pub fn result_iq(iq: &Element) -> Element {
    reply_builder(iq, IqType::Result.as_str()).build()
}

/// Build a `result` IQ answering `iq` with a single payload element.
pub fn result_iq_with(iq: &Element, payload: Element) -> Element {
    reply_builder(iq, IqType::Result.as_str())
        .append(payload)
        .build()
}

/// Build an error reply for any stanza kind (iq, message, presence).
///
/// The original payload is echoed back ahead of the `<error/>` element, as
/// RFC 6120 Section 8.3.1 permits.
pub fn error_reply(stanza: &Element, condition: StanzaErrorCondition) -> Element {
    let error = Element::builder("error", ns::JABBER_CLIENT)
        .attr("type", condition.default_type().as_str().to_string())
        .append(Element::builder(condition.as_str(), ns::STANZAS).build())
        .build();

    let mut builder = reply_builder(stanza, "error");
    for child in stanza.children().filter(|c| c.name() != "error") {
        builder = builder.append(child.clone());
    }
    builder.append(error).build()
}

/// Extract the stanza error condition carried by an error reply.
pub fn error_condition(stanza: &Element) -> Option<StanzaErrorCondition> {
    if stanza.attr("type") != Some("error") {
        return None;
    }
    stanza
        .get_child("error", ns::JABBER_CLIENT)?
        .children()
        .find(|c| c.ns() == ns::STANZAS)
        .and_then(|c| c.name().parse().ok())
}

/// Get the first child of `element` with the given name and namespace.
pub fn child<'a>(element: &'a Element, name: &str, namespace: &str) -> Option<&'a Element> {
    element.get_child(name, namespace)
}
