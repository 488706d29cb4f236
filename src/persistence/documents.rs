//! Resource documents
//!
//! Router rules and auth records are managed as documents of the shape
//!
//! ```yaml
//! kind: Router
//! api: topicd/v1
//! meta:
//!   id: orders-audit
//! spec:
//!   description: orders audit
//!   topic: orders
//!   copyTo: [audit.orders]
//! ```
//!
//! A file may hold several documents separated by `---`. Exported streams
//! start with a `# generated <timestamp>` comment.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::AuthRecord;
use crate::broker::routing::RouterRule;
use crate::persistence::ResourceStore;
use crate::utils::{BrokerError, Result};

pub const API_VERSION: &str = "topicd/v1";
const DOCUMENT_SEPARATOR: &str = "---\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Router,
    Auth,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Router, ResourceKind::Auth];

    /// Name of the resource type in a `ResourceStore`.
    pub fn resource_type(&self) -> &'static str {
        match self {
            ResourceKind::Router => "router",
            ResourceKind::Auth => "auth",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDocument {
    pub kind: ResourceKind,
    pub api: String,
    pub meta: Meta,
    pub spec: Value,
}

impl ResourceDocument {
    pub fn router(rule: &RouterRule) -> Result<Self> {
        Ok(Self::new(ResourceKind::Router, &rule.description, serde_json::to_value(rule)?))
    }

    pub fn auth(record: &AuthRecord) -> Result<Self> {
        Ok(Self::new(ResourceKind::Auth, &record.description, serde_json::to_value(record)?))
    }

    fn new(kind: ResourceKind, description: &str, spec: Value) -> Self {
        Self {
            kind,
            api: API_VERSION.to_string(),
            meta: Meta {
                id: slug(description),
            },
            spec,
        }
    }

    pub fn spec_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.spec.clone()).map_err(|e| {
            BrokerError::Document(format!("{:?} '{}': {e}", self.kind, self.meta.id))
        })
    }

    fn check(&self) -> Result<()> {
        if self.api != API_VERSION {
            return Err(BrokerError::Document(format!(
                "unsupported api '{}' in '{}'",
                self.api, self.meta.id
            )));
        }
        if self.meta.id.is_empty() {
            return Err(BrokerError::Document("document without meta.id".to_string()));
        }
        match self.kind {
            ResourceKind::Router => self.spec_as::<RouterRule>()?.validate(),
            ResourceKind::Auth => self.spec_as::<AuthRecord>()?.validate(),
        }
    }
}

/// Lower-case, dash-separated id derived from a description.
pub fn slug(description: &str) -> String {
    description
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(|part| part.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join("-")
}

/// Parse a multi-document YAML stream. Every document is validated.
pub fn parse_documents(text: &str) -> Result<Vec<ResourceDocument>> {
    let mut docs = Vec::new();
    for de in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(de)?;
        if value.is_null() {
            continue;
        }
        let doc: ResourceDocument = serde_yaml::from_value(value)?;
        doc.check()?;
        docs.push(doc);
    }
    Ok(docs)
}

pub fn export_documents(docs: &[ResourceDocument], generated_at: DateTime<Utc>) -> Result<String> {
    let mut out = format!("# generated {}\n", generated_at.to_rfc3339());
    for (idx, doc) in docs.iter().enumerate() {
        if idx > 0 {
            out.push_str(DOCUMENT_SEPARATOR);
        }
        out.push_str(&serde_yaml::to_string(doc)?);
    }
    Ok(out)
}

/// Store every document as a JSON resource, keyed by `meta.id`.
pub fn import_documents<S: ResourceStore + ?Sized>(
    store: &mut S,
    docs: &[ResourceDocument],
) -> Result<usize> {
    for doc in docs {
        let json = serde_json::to_string(&doc.spec)?;
        store.upsert_resource(doc.kind.resource_type(), &doc.meta.id, &json)?;
    }
    Ok(docs.len())
}

/// Rebuild documents of `kind` from the store.
pub fn stored_documents<S: ResourceStore + ?Sized>(
    store: &S,
    kind: ResourceKind,
) -> Result<Vec<ResourceDocument>> {
    store
        .list_resources(kind.resource_type())?
        .into_iter()
        .map(|(id, json)| -> Result<ResourceDocument> {
            Ok(ResourceDocument {
                kind,
                api: API_VERSION.to_string(),
                meta: Meta { id },
                spec: serde_json::from_str(&json)?,
            })
        })
        .collect()
}

/// Load and decode every stored resource of `kind`.
pub fn load_specs<T: DeserializeOwned, S: ResourceStore + ?Sized>(
    store: &S,
    kind: ResourceKind,
) -> Result<Vec<T>> {
    stored_documents(store, kind)?
        .iter()
        .map(|doc| doc.spec_as::<T>())
        .collect()
}
