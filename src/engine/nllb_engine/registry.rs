// nllb_engine/registry.rs — On-disk port registry
//
// A JSON file mapping live server ports to their language pairs, so a client
// can rediscover the server after a restart (and so two launches of the app
// don't fight over one port). Multiple processes may race on this file:
// writes go through a temp file + rename, and readers tolerate absent or
// partially written content by falling back to the empty registry.

use crate::atoms::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortEntry {
    pub language_pair: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortRegistry {
    /// Keys are stringified port numbers (JSON object keys are strings).
    #[serde(default)]
    pub ports: HashMap<String, PortEntry>,
}

impl PortRegistry {
    /// Read the registry. Absent or corrupt files yield the empty registry —
    /// a half-written file from a racing process must not take the engine
    /// down.
    pub fn load(path: &Path) -> PortRegistry {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(registry) => registry,
                Err(e) => {
                    warn!("[nllb] ignoring corrupt port registry {}: {}", path.display(), e);
                    PortRegistry::default()
                }
            },
            Err(_) => PortRegistry::default(),
        }
    }

    /// Atomically persist: write a sibling temp file, then rename over the
    /// target.
    pub fn store(&self, path: &Path) -> CoreResult<()> {
        let payload = serde_json::to_vec_pretty(self)
            .map_err(|e| CoreError::internal(format!("serialize port registry: {}", e)))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, payload)
            .map_err(|e| CoreError::internal(format!("write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| CoreError::internal(format!("rename {}: {}", path.display(), e)))?;
        Ok(())
    }

    /// The registered port for a language pair, if any.
    pub fn port_for_pair(&self, language_pair: &str) -> Option<u16> {
        self.ports
            .iter()
            .filter(|(_, entry)| entry.language_pair == language_pair)
            .filter_map(|(port, _)| port.parse::<u16>().ok())
            .min()
    }

    pub fn record(&mut self, port: u16, language_pair: impl Into<String>, pid: Option<u32>) {
        self.ports.insert(
            port.to_string(),
            PortEntry { language_pair: language_pair.into(), pid, updated_at: Utc::now() },
        );
    }

    pub fn remove(&mut self, port: u16) {
        self.ports.remove(&port.to_string());
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ports.json");

        let mut registry = PortRegistry::default();
        registry.record(5555, "ja-en", Some(4242));
        registry.store(&path).unwrap();

        let reloaded = PortRegistry::load(&path);
        assert_eq!(reloaded.port_for_pair("ja-en"), Some(5555));
        assert_eq!(reloaded.ports["5555"].pid, Some(4242));
    }

    #[test]
    fn test_absent_file_yields_empty_registry() {
        let registry = PortRegistry::load(Path::new("/nonexistent/ports.json"));
        assert!(registry.ports.is_empty());
    }

    #[test]
    fn test_corrupt_file_yields_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ports.json");
        std::fs::write(&path, b"{\"ports\": {\"55").unwrap();

        let registry = PortRegistry::load(&path);
        assert!(registry.ports.is_empty());
    }

    #[test]
    fn test_remove_unregisters_port() {
        let mut registry = PortRegistry::default();
        registry.record(5555, "ja-en", None);
        registry.remove(5555);
        assert_eq!(registry.port_for_pair("ja-en"), None);
    }

    #[test]
    fn test_wire_shape_matches_protocol() {
        // {"ports": {"<port>": {"language_pair": "<src>-<tgt>", ...}}}
        let raw = r#"{"ports": {"6001": {"language_pair": "en-ja", "updated_at": "2025-01-01T00:00:00Z"}}}"#;
        let registry: PortRegistry = serde_json::from_str(raw).unwrap();
        assert_eq!(registry.port_for_pair("en-ja"), Some(6001));
    }
}
