//! Cross-process tunnel registry
//!
//! A JSON document mapping UDID to its active tunnel endpoint, shared by
//! every process on the host. Writes go through a temp file and an atomic
//! rename, so readers always observe a complete document. Entries that
//! survive a crash are stale by definition; consumers must validate a port
//! by connecting before trusting it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::RemoteXpcError;

pub const REGISTRY_FILE_NAME: &str = "tunnel-registry.json";

/// One registered tunnel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRegistryEntry {
    pub udid: String,
    pub device_id: u32,
    pub address: String,
    pub rsd_port: u16,
    pub connection_type: String,
    pub product_id: u32,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryMetadata {
    pub last_updated: Option<DateTime<Utc>>,
    pub total_tunnels: usize,
    pub active_tunnels: usize,
}

/// The whole on-disk document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryDocument {
    pub tunnels: BTreeMap<String, TunnelRegistryEntry>,
    pub metadata: RegistryMetadata,
}

/// Handle to the registry file
#[derive(Debug, Clone)]
pub struct TunnelRegistry {
    path: PathBuf,
}

impl TunnelRegistry {
    /// Registry at the conventional location under `dir`
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(REGISTRY_FILE_NAME),
        }
    }

    /// Registry in the current working directory
    pub fn in_cwd() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_dir()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the document, treating a missing or malformed file as empty
    pub fn load(&self) -> RegistryDocument {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(_) => return RegistryDocument::default(),
        };
        match serde_json::from_slice(&bytes) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Tunnel registry is malformed, treating as empty: {e:?}");
                RegistryDocument::default()
            }
        }
    }

    /// Merges tunnel results into the registry
    ///
    /// Existing entries keep their `createdAt`; everything else is
    /// overwritten and `lastUpdated` is bumped. Concurrent writers across
    /// processes are last-writer-wins.
    pub fn update(
        &self,
        entries: impl IntoIterator<Item = TunnelRegistryEntry>,
    ) -> Result<(), RemoteXpcError> {
        let mut doc = self.load();
        let now = Utc::now();

        for mut entry in entries {
            entry.last_updated = now;
            if let Some(existing) = doc.tunnels.get(&entry.udid) {
                entry.created_at = existing.created_at;
            }
            doc.tunnels.insert(entry.udid.clone(), entry);
        }

        doc.metadata = RegistryMetadata {
            last_updated: Some(now),
            total_tunnels: doc.tunnels.len(),
            active_tunnels: doc.tunnels.len(),
        };

        self.write_atomic(&doc)
    }

    /// Resets the registry to empty, deleting the file as a fallback
    pub fn clear(&self) {
        debug!("Clearing tunnel registry at {:?}", self.path);
        if self.write_atomic(&RegistryDocument::default()).is_err()
            && let Err(e) = std::fs::remove_file(&self.path)
        {
            warn!("Failed to clear or delete tunnel registry: {e:?}");
        }
    }

    fn write_atomic(&self, doc: &RegistryDocument) -> Result<(), RemoteXpcError> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Clears the registry when the process is told to terminate
    ///
    /// Listens for SIGINT, SIGTERM and SIGHUP; whichever arrives first
    /// clears the file and exits with the conventional code.
    #[cfg(unix)]
    pub fn spawn_signal_cleanup(&self) {
        use tokio::signal::unix::{SignalKind, signal};

        for (kind, code) in [
            (SignalKind::interrupt(), 130),
            (SignalKind::terminate(), 143),
            (SignalKind::hangup(), 129),
        ] {
            let registry = self.clone();
            tokio::spawn(async move {
                let mut stream = match signal(kind) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("Failed to install signal handler: {e:?}");
                        return;
                    }
                };
                stream.recv().await;
                registry.clear();
                std::process::exit(code);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(udid: &str, port: u16) -> TunnelRegistryEntry {
        TunnelRegistryEntry {
            udid: udid.to_string(),
            device_id: 1,
            address: "fd12:3456::1".to_string(),
            rsd_port: port,
            connection_type: "USB".to_string(),
            product_id: 0x12a8,
            created_at: Utc::now(),
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn missing_and_malformed_files_load_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TunnelRegistry::new(dir.path());
        assert!(registry.load().tunnels.is_empty());

        std::fs::write(registry.path(), b"{not json").unwrap();
        assert!(registry.load().tunnels.is_empty());
    }

    #[test]
    fn two_writers_both_land() {
        let dir = tempfile::tempdir().unwrap();
        let writer_a = TunnelRegistry::new(dir.path());
        let writer_b = writer_a.clone();

        writer_a.update([entry("udid-a", 1111)]).unwrap();
        writer_b.update([entry("udid-b", 2222)]).unwrap();

        // the file is valid JSON at every observation point
        let raw = std::fs::read(writer_a.path()).unwrap();
        let doc: RegistryDocument = serde_json::from_slice(&raw).unwrap();
        assert_eq!(doc.tunnels.len(), 2);
        assert_eq!(doc.metadata.total_tunnels, 2);
        assert_eq!(doc.tunnels["udid-a"].rsd_port, 1111);
        assert_eq!(doc.tunnels["udid-b"].rsd_port, 2222);
    }

    #[test]
    fn update_preserves_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TunnelRegistry::new(dir.path());

        registry.update([entry("udid-a", 1111)]).unwrap();
        let created = registry.load().tunnels["udid-a"].created_at;

        registry.update([entry("udid-a", 3333)]).unwrap();
        let doc = registry.load();
        assert_eq!(doc.tunnels["udid-a"].created_at, created);
        assert_eq!(doc.tunnels["udid-a"].rsd_port, 3333);
        assert!(doc.tunnels["udid-a"].last_updated >= created);
    }

    #[test]
    fn clear_resets_the_document() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TunnelRegistry::new(dir.path());
        registry.update([entry("udid-a", 1111)]).unwrap();
        registry.clear();
        let doc = registry.load();
        assert!(doc.tunnels.is_empty());
        assert_eq!(doc.metadata.total_tunnels, 0);
    }

    #[test]
    fn roundtrip_is_stable_modulo_last_updated() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TunnelRegistry::new(dir.path());
        registry
            .update([entry("udid-a", 1111), entry("udid-b", 2222)])
            .unwrap();

        let first = std::fs::read(registry.path()).unwrap();
        let doc = registry.load();

        // saving the loaded document back unchanged yields the same bytes
        registry.write_atomic(&doc).unwrap();
        let second = std::fs::read(registry.path()).unwrap();
        assert_eq!(first, second);
    }
}
