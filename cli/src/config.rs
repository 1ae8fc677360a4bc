// Config and community file handling for the satellite binary
//
// Node config lives in:
// - Linux: ~/.config/satellite/node.json
// - macOS: ~/Library/Application Support/satellite/node.json
// - Windows: %APPDATA%\satellite\node.json

use anyhow::{Context, Result};
use satellite_core::{CommunityDefinition, Event};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Default node config path (cross-platform)
pub fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .context("Failed to determine config directory")?
        .join("satellite");
    Ok(dir.join("node.json"))
}

/// Load a community from a JSON file
///
/// Accepts either a plain definition `{"owner", "addresses"}` or a signed
/// community definition event, whose `r` tags supply the addresses.
pub fn load_community(path: &Path) -> Result<CommunityDefinition> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read community file {}", path.display()))?;
    parse_community(&contents)
        .with_context(|| format!("Failed to parse community file {}", path.display()))
}

fn parse_community(contents: &str) -> Result<CommunityDefinition> {
    let value: Value = serde_json::from_str(contents)?;
    if value.get("addresses").is_some() {
        return Ok(serde_json::from_value(value)?);
    }
    let event: Event = serde_json::from_value(value)?;
    let definition = CommunityDefinition::from_event(&event);
    anyhow::ensure!(
        !definition.addresses.is_empty(),
        "community event {} has no relay addresses",
        event.id
    );
    Ok(definition)
}

/// Single-key patch for `config set`; values that are not JSON become strings
pub fn config_patch(key: &str, raw: &str) -> Map<String, Value> {
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    let mut patch = Map::new();
    patch.insert(key.to_string(), value);
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use satellite_core::AddressTag;
    use serde_json::json;

    #[test]
    fn test_config_patch_parses_json_values() {
        assert_eq!(config_patch("relayPort", "4869")["relayPort"], json!(4869));
        assert_eq!(config_patch("autoListen", "false")["autoListen"], json!(false));
        assert_eq!(config_patch("owner", "abc")["owner"], json!("abc"));
    }

    #[test]
    fn test_parse_plain_definition() {
        let definition = parse_community(
            r#"{"owner": "pk", "addresses": [{"type": "direct", "url": "wss://relay.example.com"}]}"#,
        )
        .unwrap();
        assert_eq!(definition.direct_url(), Some("wss://relay.example.com"));
    }

    #[test]
    fn test_parse_definition_event() {
        let definition = parse_community(
            &json!({
                "id": "def",
                "pubkey": "pk",
                "created_at": 1,
                "kind": 12012,
                "tags": [["r", "wss://relay.example.com"]],
                "content": "",
                "sig": ""
            })
            .to_string(),
        )
        .unwrap();
        assert_eq!(definition.owner, "pk");
        assert_eq!(
            definition.addresses,
            vec![AddressTag::Direct {
                url: "wss://relay.example.com".to_string()
            }]
        );

        assert!(parse_community(r#"{"id":"x","pubkey":"pk","created_at":1,"kind":12012}"#).is_err());
    }

    #[test]
    fn test_load_community_reports_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("missing.json");
        let err = load_community(&missing).unwrap_err();
        assert!(err.to_string().contains("missing.json"));
    }
}
