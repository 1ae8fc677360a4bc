//! Community definitions and their relay address tags

use crate::event::Event;
use serde::{Deserialize, Serialize};

/// Where a community's upstream relay can be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AddressTag {
    /// A relay URL that can be dialed as-is
    Direct { url: String },
    /// An address that must be resolved to a host/port first
    Tunnel { address: String, transport: String },
}

/// Immutable description of a hosted community
///
/// A changed community produces a new definition; links built from the old
/// one are torn down rather than updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityDefinition {
    /// Identity that owns the community
    pub owner: String,
    /// Address tags in definition order
    pub addresses: Vec<AddressTag>,
}

impl CommunityDefinition {
    pub fn new(owner: impl Into<String>, addresses: Vec<AddressTag>) -> Self {
        Self {
            owner: owner.into(),
            addresses,
        }
    }

    /// Build a definition from a community definition event's `r` tags
    ///
    /// `["r", "wss://..."]` is a direct address; `["r", addr, hint]` with a
    /// transport hint is a tunnel address. Other `r` tags are skipped.
    pub fn from_event(event: &Event) -> Self {
        let addresses = event
            .tags
            .iter()
            .filter(|t| t.first().map(String::as_str) == Some("r"))
            .filter_map(|t| {
                let value = t.get(1).filter(|v| !v.is_empty())?;
                match t.get(2).filter(|h| !h.is_empty()) {
                    Some(hint) => Some(AddressTag::Tunnel {
                        address: value.clone(),
                        transport: hint.clone(),
                    }),
                    None if value.starts_with("ws") => Some(AddressTag::Direct {
                        url: value.clone(),
                    }),
                    None => None,
                }
            })
            .collect();

        Self {
            owner: event.pubkey.clone(),
            addresses,
        }
    }

    /// First direct relay URL, if any
    pub fn direct_url(&self) -> Option<&str> {
        self.addresses.iter().find_map(|a| match a {
            AddressTag::Direct { url } => Some(url.as_str()),
            _ => None,
        })
    }

    /// First tunnel address, if any
    pub fn tunnel_address(&self) -> Option<&str> {
        self.addresses.iter().find_map(|a| match a {
            AddressTag::Tunnel { address, .. } => Some(address.as_str()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_from_event_classifies_address_tags() {
        let event = Event {
            id: "def".to_string(),
            pubkey: "owner".to_string(),
            created_at: 0,
            kind: 12012,
            tags: vec![
                tag(&["r", "abcdef0123", "hyper"]),
                tag(&["d", "community"]),
                tag(&["r", "wss://relay.example.com"]),
                tag(&["r", "https://not-a-relay.example.com"]),
                tag(&["r", ""]),
            ],
            content: String::new(),
            sig: String::new(),
        };

        let definition = CommunityDefinition::from_event(&event);
        assert_eq!(definition.owner, "owner");
        assert_eq!(
            definition.addresses,
            vec![
                AddressTag::Tunnel {
                    address: "abcdef0123".to_string(),
                    transport: "hyper".to_string(),
                },
                AddressTag::Direct {
                    url: "wss://relay.example.com".to_string(),
                },
            ]
        );
        assert_eq!(definition.direct_url(), Some("wss://relay.example.com"));
        assert_eq!(definition.tunnel_address(), Some("abcdef0123"));
    }

    #[test]
    fn test_definition_without_addresses() {
        let definition = CommunityDefinition::new("owner", Vec::new());
        assert!(definition.direct_url().is_none());
        assert!(definition.tunnel_address().is_none());
    }
}
