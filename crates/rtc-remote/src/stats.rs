//! Statistics report records returned by `getStats`, restored to the
//! names/stat accessor shape without keeping the intermediate plain map in
//! the public surface.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct StatsReport {
    pub id: String,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, deserialize_with = "stat_entries")]
    stats: Vec<(String, Value)>,
}

impl StatsReport {
    /// Names of the stats carried by this report, in the order the remote
    /// reported them.
    pub fn names(&self) -> Vec<&str> {
        self.stats.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn stat(&self, name: &str) -> Option<&Value> {
        self.stats
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }
}

// Entries stay in wire order; a plain map would re-key them.
fn stat_entries<'de, D>(deserializer: D) -> Result<Vec<(String, Value)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct Entries;

    impl<'de> Visitor<'de> for Entries {
        type Value = Vec<(String, Value)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of stat names to values")
        }

        fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
            while let Some(entry) = access.next_entry()? {
                entries.push(entry);
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(Entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn report_restores_names_and_stat_lookup() {
        let report: StatsReport = serde_json::from_value(json!({
            "id": "r1",
            "timestamp": 1000,
            "type": "inbound-rtp",
            "stats": { "bytesReceived": 42 }
        }))
        .unwrap();
        assert_eq!(report.id, "r1");
        assert_eq!(report.timestamp, 1000.0);
        assert_eq!(report.kind, "inbound-rtp");
        assert_eq!(report.names(), vec!["bytesReceived"]);
        assert_eq!(report.stat("bytesReceived"), Some(&json!(42)));
        assert_eq!(report.stat("bytesSent"), None);
    }

    #[test]
    fn names_keep_the_reported_order() {
        let report: StatsReport = serde_json::from_value(json!({
            "id": "r1",
            "timestamp": 1000,
            "type": "inbound-rtp",
            "stats": { "packetsLost": 1, "bytesReceived": 42 }
        }))
        .unwrap();
        assert_eq!(report.names(), vec!["packetsLost", "bytesReceived"]);
    }
}
