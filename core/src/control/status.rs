// Status snapshot shown to operators

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub listening: bool,
    pub relays_connected: BTreeMap<String, bool>,
    pub db_count: u64,
    pub db_size: u64,
}

/// Partial update; absent fields keep their value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listening: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relays_connected: Option<BTreeMap<String, bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_size: Option<u64>,
}

impl StatusPatch {
    pub fn database(count: u64, size: u64) -> Self {
        Self {
            db_count: Some(count),
            db_size: Some(size),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply(&self, snapshot: &mut StatusSnapshot) {
        if let Some(listening) = self.listening {
            snapshot.listening = listening;
        }
        if let Some(relays) = &self.relays_connected {
            snapshot.relays_connected = relays.clone();
        }
        if let Some(count) = self.db_count {
            snapshot.db_count = count;
        }
        if let Some(size) = self.db_size {
            snapshot.db_size = size;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_patch_only_touches_present_fields() {
        let mut snapshot = StatusSnapshot {
            listening: true,
            ..Default::default()
        };
        StatusPatch::database(12, 3400).apply(&mut snapshot);

        assert!(snapshot.listening);
        assert_eq!(snapshot.db_count, 12);
        assert_eq!(snapshot.db_size, 3400);
    }

    #[test]
    fn test_camel_case_wire_names() {
        let patch = StatusPatch::database(1, 2);
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!({"dbCount": 1, "dbSize": 2})
        );
        assert!(StatusPatch::default().is_empty());
        assert!(serde_json::to_value(StatusSnapshot::default())
            .unwrap()
            .get("relaysConnected")
            .is_some());
    }
}
