//! Service Discovery registrations (XEP-0030).
//!
//! Modules announce what they support by calling into [`DiscoInfo`] once at
//! construction. Answering disco#info queries from these registrations is the
//! job of the outer server.

use dashmap::DashMap;
use minidom::Element;

/// Service Discovery info namespace (XEP-0030).
pub const DISCO_INFO_NS: &str = "http://jabber.org/protocol/disco#info";

/// Identity element for disco#info response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Category (e.g., "server", "account")
    pub category: String,
    /// Type (e.g., "im", "registered")
    pub type_: String,
    /// Optional name (human-readable)
    pub name: Option<String>,
}

impl Identity {
    /// Create a new identity.
    pub fn new(category: &str, type_: &str, name: Option<&str>) -> Self {
        Self {
            category: category.to_string(),
            type_: type_.to_string(),
            name: name.map(|s| s.to_string()),
        }
    }

    /// Server identity (category="server", type="im").
    pub fn server(name: Option<&str>) -> Self {
        Self::new("server", "im", name)
    }
}

/// Feature element for disco#info response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feature(pub String);

impl Feature {
    /// Create a new feature.
    pub fn new(var: &str) -> Self {
        Self(var.to_string())
    }
}

#[derive(Debug, Default)]
struct Entity {
    identities: Vec<Identity>,
    features: Vec<Feature>,
}

/// Aggregates identities and features per entity `(jid, node)`.
#[derive(Debug, Default)]
pub struct DiscoInfo {
    entities: DashMap<(String, Option<String>), Entity>,
}

impl DiscoInfo {
    /// Create an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a feature for an entity. Registering twice is a no-op.
    pub fn add_feature(&self, jid: &str, node: Option<&str>, var: &str) {
        let mut entity = self.entities.entry(key(jid, node)).or_default();
        let feature = Feature::new(var);
        if !entity.features.contains(&feature) {
            entity.features.push(feature);
        }
    }

    /// Register an identity for an entity. Registering twice is a no-op.
    pub fn add_identity(&self, jid: &str, node: Option<&str>, identity: Identity) {
        let mut entity = self.entities.entry(key(jid, node)).or_default();
        if !entity.identities.contains(&identity) {
            entity.identities.push(identity);
        }
    }

    /// Features registered for an entity, in registration order.
    pub fn features(&self, jid: &str, node: Option<&str>) -> Vec<Feature> {
        self.entities
            .get(&key(jid, node))
            .map(|e| e.features.clone())
            .unwrap_or_default()
    }

    /// Identities registered for an entity, in registration order.
    pub fn identities(&self, jid: &str, node: Option<&str>) -> Vec<Identity> {
        self.entities
            .get(&key(jid, node))
            .map(|e| e.identities.clone())
            .unwrap_or_default()
    }

    /// Check whether an entity advertises a feature.
    pub fn has_feature(&self, jid: &str, node: Option<&str>, var: &str) -> bool {
        self.entities
            .get(&key(jid, node))
            .map(|e| e.features.iter().any(|f| f.0 == var))
            .unwrap_or(false)
    }

    /// Build the `<query/>` payload of a disco#info result for an entity.
    pub fn build_query(&self, jid: &str, node: Option<&str>) -> Element {
        let mut query_builder = Element::builder("query", DISCO_INFO_NS);
        if let Some(n) = node {
            query_builder = query_builder.attr("node", n.to_string());
        }

        for identity in self.identities(jid, node) {
            let mut id_builder = Element::builder("identity", DISCO_INFO_NS)
                .attr("category", identity.category)
                .attr("type", identity.type_);
            if let Some(name) = identity.name {
                id_builder = id_builder.attr("name", name);
            }
            query_builder = query_builder.append(id_builder.build());
        }

        for feature in self.features(jid, node) {
            let feat_elem = Element::builder("feature", DISCO_INFO_NS)
                .attr("var", feature.0)
                .build();
            query_builder = query_builder.append(feat_elem);
        }

        query_builder.build()
    }
}

fn key(jid: &str, node: Option<&str>) -> (String, Option<String>) {
    (jid.to_string(), node.map(|n| n.to_string()))
}
