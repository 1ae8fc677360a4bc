//! Event and filter records as they travel between relays
//!
//! Only the fields the bridge routes on are interpreted here. Signatures and
//! ids are carried opaquely; verification belongs to the local relay.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of an encrypted direct message
pub const KIND_ENCRYPTED_DM: u32 = 4;

/// A signed, typed record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sig: String,
}

impl Event {
    /// Values of every tag named `name`, in tag order
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1).map(String::as_str))
    }
}

/// A subscription filter
///
/// Tag filters are serialized under `#<name>` keys, e.g. `"#h": ["room"]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Restrict to events carrying tag `name` with one of `values`
    pub fn tag(mut self, name: &str, values: impl IntoIterator<Item = String>) -> Self {
        self.tags
            .insert(format!("#{}", name), values.into_iter().collect());
        self
    }

    /// Values of the `#<name>` tag filter, if present
    pub fn tag_values(&self, name: &str) -> Option<&[String]> {
        self.tags.get(&format!("#{}", name)).map(Vec::as_slice)
    }
}
