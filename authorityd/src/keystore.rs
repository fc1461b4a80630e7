//! Issuer signing-key material for the daemon process.
//!
//! `issue`/`delegate` sign the new mandate under the *issuer's* private key
//! (spec §4.E step 6). A caller submitting an HTTP request has no private
//! key to hand over, so the daemon process is the one thing in this system
//! trusted to hold signing key material: it loads one 32-byte Ed25519 seed
//! per principal from a directory at startup and never writes key material
//! back out. This is an operational trust boundary, not a custody service —
//! rotating or revoking a principal's key is an out-of-band file-system
//! operation, not something this process automates.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use ed25519_dalek::SigningKey;

use authority_spec::PrincipalId;

/// Loaded `principal_id -> signing key` map, read once at startup.
pub struct Keystore {
    keys: HashMap<PrincipalId, SigningKey>,
}

impl Keystore {
    /// Load every `<principal_id>.key` file under `dir` (each exactly 32
    /// raw bytes: an Ed25519 seed). An empty or missing directory yields an
    /// empty keystore rather than an error, so a read-only deployment with
    /// no local issuers still starts.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let mut keys = HashMap::new();
        if !dir.exists() {
            return Ok(Self { keys });
        }
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("failed to list keystore directory {}", dir.display()))?
        {
            let entry = entry.context("failed to read keystore directory entry")?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("key") {
                continue;
            }
            let principal_id = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .with_context(|| format!("non-UTF8 keystore file name {}", path.display()))?
                .to_string();
            let bytes = std::fs::read(&path)
                .with_context(|| format!("failed to read keystore file {}", path.display()))?;
            let seed: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
                anyhow::anyhow!(
                    "keystore file {} is {} bytes, expected 32",
                    path.display(),
                    bytes.len()
                )
            })?;
            keys.insert(principal_id, SigningKey::from_bytes(&seed));
        }
        Ok(Self { keys })
    }

    /// The signing key for `principal_id`, if this daemon holds one.
    pub fn get(&self, principal_id: &str) -> Option<&SigningKey> {
        self.keys.get(principal_id)
    }

    /// Number of principals this daemon can sign on behalf of.
    pub fn len(&self) -> usize {
        self.keys.len()
    }
}
