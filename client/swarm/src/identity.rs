//! Node identity and private-swarm key persistence.
//!
//! The identity file holds the ed25519 secret behind this node's peer id
//! (`/dswarm/identity/1.0.0/ed25519/<hex>`); the PSK file uses the
//! libp2p swarm-key format. Both are written with mode 0600, and a
//! malformed file is an error — never silently regenerated, since that
//! would quietly change the node's identity.

use std::fs;
use std::path::Path;

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use dsc_common::PeerId;

const LOG_TARGET: &str = "identity";

pub const IDENTITY_HEADER: &str = "/dswarm/identity/1.0.0/ed25519/";
pub const PSK_HEADER: &str = "/key/swarm/psk/1.0.0/";
pub const PSK_ENCODING: &str = "/base16/";

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("malformed key file {path}: {reason}")]
    Malformed { path: String, reason: &'static str },
    #[error("key file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Identity {
    signing_key: SigningKey,
    peer_id: PeerId,
}

impl Identity {
    fn from_signing_key(signing_key: SigningKey) -> Self {
        let peer_id = peer_id_of(&signing_key.verifying_key());
        Self {
            signing_key,
            peer_id,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

/// The peer id is the truncated hex SHA-256 of the public key.
fn peer_id_of(key: &VerifyingKey) -> PeerId {
    let digest = Sha256::digest(key.to_bytes());
    PeerId::from(&hex::encode(digest)[..40])
}

#[cfg(unix)]
fn restrict_mode(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_mode(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Load the node identity from `path`, creating and persisting a fresh
/// one when the file does not exist.
pub fn load_or_create_identity(path: &Path) -> Result<Identity, IdentityError> {
    if path.exists() {
        let content = fs::read_to_string(path)?;
        let hex_part = content
            .strip_prefix(IDENTITY_HEADER)
            .ok_or_else(|| IdentityError::Malformed {
                path: path.display().to_string(),
                reason: "missing identity header",
            })?
            .trim();
        let mut secret = [0u8; 32];
        hex::decode_to_slice(hex_part, &mut secret).map_err(|_| IdentityError::Malformed {
            path: path.display().to_string(),
            reason: "secret is not 64 hex characters",
        })?;
        return Ok(Identity::from_signing_key(SigningKey::from_bytes(&secret)));
    }

    let signing_key = SigningKey::generate(&mut OsRng);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = format!("{IDENTITY_HEADER}{}\n", hex::encode(signing_key.to_bytes()));
    fs::write(path, content)?;
    restrict_mode(path)?;
    let identity = Identity::from_signing_key(signing_key);
    tracing::info!(target: LOG_TARGET, peer_id = %identity.peer_id, "generated new node identity");
    Ok(identity)
}

/// Load the swarm pre-shared key from `path`, creating one when absent.
pub fn load_or_create_psk(path: &Path) -> Result<[u8; 32], IdentityError> {
    if path.exists() {
        let content = fs::read_to_string(path)?;
        let mut lines = content.lines();
        if lines.next() != Some(PSK_HEADER) {
            return Err(IdentityError::Malformed {
                path: path.display().to_string(),
                reason: "missing psk header",
            });
        }
        if lines.next() != Some(PSK_ENCODING) {
            return Err(IdentityError::Malformed {
                path: path.display().to_string(),
                reason: "unsupported psk encoding",
            });
        }
        let hex_part = lines.next().unwrap_or("").trim();
        let mut key = [0u8; 32];
        hex::decode_to_slice(hex_part, &mut key).map_err(|_| IdentityError::Malformed {
            path: path.display().to_string(),
            reason: "psk is not 64 hex characters",
        })?;
        return Ok(key);
    }

    let mut key = [0u8; 32];
    use rand::RngCore;
    OsRng.fill_bytes(&mut key);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = format!("{PSK_HEADER}\n{PSK_ENCODING}\n{}\n", hex::encode(key));
    fs::write(path, content)?;
    restrict_mode(path)?;
    tracing::info!(target: LOG_TARGET, path = %path.display(), "generated new swarm psk");
    Ok(key)
}
