// Jackson Coxson

use std::path::{Path, PathBuf};

use ed25519_dalek::{SigningKey, VerifyingKey};
use plist::Data;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::RemoteXpcError;

/// The long-term controller identity persisted after a successful
/// Pair-Setup
///
/// Rewritten in place on re-pair. Callers must not save the same
/// identifier from two tasks at once.
#[derive(Clone)]
pub struct PairRecord {
    pub private_key: SigningKey,
    pub public_key: VerifyingKey,
    pub remote_unlock_host_key: String,
}

#[derive(Serialize, Deserialize)]
struct RawPairRecord {
    public_key: Data,
    private_key: Data,
    remote_unlock_host_key: String,
}

impl PairRecord {
    /// Generates a fresh Ed25519 controller identity
    pub fn generate() -> Self {
        let private_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let public_key = VerifyingKey::from(&private_key);
        Self {
            private_key,
            public_key,
            remote_unlock_host_key: String::new(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RemoteXpcError> {
        let raw: RawPairRecord = match plist::from_bytes(bytes) {
            Ok(r) => r,
            Err(e) => {
                warn!("Unable to parse bytes as a pair record: {e:?}");
                return Err(RemoteXpcError::Plist(e));
            }
        };

        let private: Vec<u8> = raw.private_key.into();
        let private: [u8; 32] = private
            .try_into()
            .map_err(|_| RemoteXpcError::UnexpectedResponse)?;
        let private_key = SigningKey::from_bytes(&private);

        let public: Vec<u8> = raw.public_key.into();
        let public: [u8; 32] = public
            .try_into()
            .map_err(|_| RemoteXpcError::UnexpectedResponse)?;
        let public_key = VerifyingKey::from_bytes(&public)
            .map_err(|_| RemoteXpcError::UnexpectedResponse)?;

        Ok(Self {
            private_key,
            public_key,
            remote_unlock_host_key: raw.remote_unlock_host_key,
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>, RemoteXpcError> {
        let raw = RawPairRecord {
            public_key: Data::new(self.public_key.to_bytes().to_vec()),
            private_key: Data::new(self.private_key.to_bytes().to_vec()),
            remote_unlock_host_key: self.remote_unlock_host_key.clone(),
        };
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &raw)?;
        Ok(buf)
    }
}

impl std::fmt::Debug for PairRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairRecord")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Directory-backed store for pair records, keyed by device identifier
#[derive(Debug, Clone)]
pub struct PairingStore {
    dir: PathBuf,
}

impl PairingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The on-disk location for a device's record
    pub fn record_path(&self, identifier: &str) -> PathBuf {
        self.dir.join(format!("remote_{identifier}.plist"))
    }

    pub async fn save(
        &self,
        identifier: &str,
        record: &PairRecord,
    ) -> Result<PathBuf, RemoteXpcError> {
        let path = self.record_path(identifier);
        let bytes = record.serialize()?;
        tokio::fs::create_dir_all(&self.dir).await.ok();
        if let Err(e) = tokio::fs::write(&path, bytes).await {
            warn!("Failed to write pair record to {path:?}: {e:?}");
            return Err(RemoteXpcError::SaveError);
        }
        Ok(path)
    }

    pub async fn load(&self, identifier: &str) -> Result<PairRecord, RemoteXpcError> {
        let path = self.record_path(identifier);
        let bytes = tokio::fs::read(&path).await?;
        PairRecord::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = PairingStore::new(dir.path());

        let record = PairRecord::generate();
        let path = store.save("00008120-000A1B2C3D4E", &record).await.unwrap();
        assert!(
            path.file_name()
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("remote_")
        );

        let loaded = store.load("00008120-000A1B2C3D4E").await.unwrap();
        assert_eq!(loaded.public_key, record.public_key);
        assert_eq!(
            loaded.private_key.to_bytes(),
            record.private_key.to_bytes()
        );
        assert_eq!(loaded.remote_unlock_host_key, "");
    }

    #[test]
    fn serialized_record_has_expected_keys() {
        let record = PairRecord::generate();
        let bytes = record.serialize().unwrap();
        let parsed: plist::Dictionary = plist::from_bytes(&bytes).unwrap();
        let public = parsed.get("public_key").and_then(|x| x.as_data()).unwrap();
        let private = parsed.get("private_key").and_then(|x| x.as_data()).unwrap();
        assert_eq!(public.len(), 32);
        assert_eq!(private.len(), 32);
        assert!(parsed.get("remote_unlock_host_key").is_some());
    }
}
