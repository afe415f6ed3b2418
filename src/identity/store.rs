//! # Identity Store
//!
//! Enrollment writes identities here and the transport reads them back when
//! it builds a TLS client configuration. Both depend only on the
//! [`IdentityStore`] trait.
//!
//! Two adapters ship with the crate:
//! - [`MemoryIdentityStore`]: process-local map, for tests and ephemeral clients
//! - [`FileIdentityStore`]: PEM files in a directory, owner-only permissions,
//!   private key sealed with ChaCha20-Poly1305 when a passphrase is supplied
//!
//! ## File layout
//! ```text
//! <dir>/<alias>.crt.pem     leaf certificate
//! <dir>/<alias>.chain.pem   issuer chain (may be empty)
//! <dir>/<alias>.key.pem     private key, unencrypted
//! <dir>/<alias>.key.sealed  salt(16) || nonce(12) || ciphertext, when a passphrase is used
//! ```
//!
//! The sealing key is PBKDF2-HMAC-SHA256 over the passphrase and the per-file salt.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::Rng;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::{pem_private_key, Identity};
use crate::error::{constants, ProtocolError, Result};

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KDF_ROUNDS: u32 = 100_000;

/// Storage for identities keyed by alias
pub trait IdentityStore: Send + Sync {
    /// Insert or replace the identity under its alias.
    fn store(&self, identity: &Identity, passphrase: Option<&str>) -> Result<()>;

    /// Load an identity, `None` when the alias is unknown.
    fn load(&self, alias: &str, passphrase: Option<&str>) -> Result<Option<Identity>>;

    /// Remove an identity; returns whether it existed.
    fn remove(&self, alias: &str) -> Result<bool>;

    fn aliases(&self) -> Result<Vec<String>>;
}

/// In-memory identity store
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    identities: RwLock<HashMap<String, Identity>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn store(&self, identity: &Identity, _passphrase: Option<&str>) -> Result<()> {
        let mut identities = self
            .identities
            .write()
            .map_err(|_| ProtocolError::IdentityStorage(constants::ERR_LOCK_POISONED.into()))?;
        identities.insert(identity.alias().to_string(), identity.clone());
        Ok(())
    }

    fn load(&self, alias: &str, _passphrase: Option<&str>) -> Result<Option<Identity>> {
        let identities = self
            .identities
            .read()
            .map_err(|_| ProtocolError::IdentityStorage(constants::ERR_LOCK_POISONED.into()))?;
        Ok(identities.get(alias).cloned())
    }

    fn remove(&self, alias: &str) -> Result<bool> {
        let mut identities = self
            .identities
            .write()
            .map_err(|_| ProtocolError::IdentityStorage(constants::ERR_LOCK_POISONED.into()))?;
        Ok(identities.remove(alias).is_some())
    }

    fn aliases(&self) -> Result<Vec<String>> {
        let identities = self
            .identities
            .read()
            .map_err(|_| ProtocolError::IdentityStorage(constants::ERR_LOCK_POISONED.into()))?;
        let mut aliases: Vec<String> = identities.keys().cloned().collect();
        aliases.sort();
        Ok(aliases)
    }
}

/// Directory-backed identity store
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    dir: PathBuf,
}

impl FileIdentityStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| storage_error("create store directory", e))?;
        restrict_permissions(&dir, 0o700)?;
        info!(path = %dir.display(), "Identity store opened");
        Ok(Self { dir })
    }

    fn path(&self, alias: &str, suffix: &str) -> Result<PathBuf> {
        validate_alias(alias)?;
        Ok(self.dir.join(format!("{alias}.{suffix}")))
    }

    fn write_private(&self, path: &Path, contents: &[u8]) -> Result<()> {
        fs::write(path, contents).map_err(|e| storage_error("write identity file", e))?;
        restrict_permissions(path, 0o600)
    }
}

impl IdentityStore for FileIdentityStore {
    fn store(&self, identity: &Identity, passphrase: Option<&str>) -> Result<()> {
        let alias = identity.alias();
        let plain_key = self.path(alias, "key.pem")?;
        let sealed_key = self.path(alias, "key.sealed")?;

        self.write_private(&self.path(alias, "crt.pem")?, identity.certificate_pem().as_bytes())?;
        self.write_private(&self.path(alias, "chain.pem")?, identity.chain_pem().as_bytes())?;

        match passphrase {
            Some(passphrase) => {
                let sealed = seal(identity.private_key_pem().as_bytes(), passphrase)?;
                self.write_private(&sealed_key, &sealed)?;
                remove_if_present(&plain_key)?;
            }
            None => {
                self.write_private(&plain_key, identity.private_key_pem().as_bytes())?;
                remove_if_present(&sealed_key)?;
            }
        }

        debug!(alias, sealed = passphrase.is_some(), "Identity stored");
        Ok(())
    }

    fn load(&self, alias: &str, passphrase: Option<&str>) -> Result<Option<Identity>> {
        let cert_path = self.path(alias, "crt.pem")?;
        if !cert_path.exists() {
            return Ok(None);
        }
        let cert_pem = fs::read_to_string(&cert_path).map_err(|e| storage_error("read certificate", e))?;
        let chain_pem = fs::read_to_string(self.path(alias, "chain.pem")?).unwrap_or_default();

        let sealed_path = self.path(alias, "key.sealed")?;
        let key_pem: Zeroizing<String> = if sealed_path.exists() {
            let passphrase = passphrase.ok_or_else(|| {
                ProtocolError::IdentityStorage(format!("Identity '{alias}' requires a passphrase"))
            })?;
            let sealed = fs::read(&sealed_path).map_err(|e| storage_error("read sealed key", e))?;
            let plain = open_sealed(&sealed, passphrase)?;
            Zeroizing::new(
                String::from_utf8(plain.to_vec())
                    .map_err(|_| ProtocolError::IdentityStorage("Sealed key is not PEM".into()))?,
            )
        } else {
            Zeroizing::new(
                fs::read_to_string(self.path(alias, "key.pem")?)
                    .map_err(|e| storage_error("read private key", e))?,
            )
        };

        // validate the key block before handing the identity out
        pem_private_key(&key_pem)?;
        Identity::from_pem(alias, &cert_pem, &key_pem, &chain_pem).map(Some)
    }

    fn remove(&self, alias: &str) -> Result<bool> {
        let mut existed = false;
        for suffix in ["crt.pem", "chain.pem", "key.pem", "key.sealed"] {
            existed |= remove_if_present(&self.path(alias, suffix)?)?;
        }
        Ok(existed)
    }

    fn aliases(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| storage_error("list store", e))?;
        let mut aliases: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.strip_suffix(".crt.pem"))
                    .map(str::to_owned)
            })
            .collect();
        aliases.sort();
        Ok(aliases)
    }
}

fn validate_alias(alias: &str) -> Result<()> {
    let valid = !alias.is_empty()
        && !alias.starts_with('.')
        && alias
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ProtocolError::IdentityStorage(format!("Invalid identity alias: '{alias}'")))
    }
}

fn storage_error(action: &str, e: std::io::Error) -> ProtocolError {
    ProtocolError::IdentityStorage(format!("Failed to {action}: {e}"))
}

fn remove_if_present(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(storage_error("remove identity file", e)),
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| storage_error("set permissions", e))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, KDF_ROUNDS, &mut key[..]);
    key
}

fn seal(plaintext: &[u8], passphrase: &str) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    let mut rng = rand::rng();
    rng.fill(&mut salt);
    rng.fill(&mut nonce);

    let key = derive_key(passphrase, &salt);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| ProtocolError::IdentityStorage("Failed to seal private key".into()))?;

    let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open_sealed(sealed: &[u8], passphrase: &str) -> Result<Zeroizing<Vec<u8>>> {
    if sealed.len() <= SALT_LEN + NONCE_LEN {
        return Err(ProtocolError::IdentityStorage("Sealed key is truncated".into()));
    }
    let (salt, rest) = sealed.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
    let key = derive_key(passphrase, salt);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| ProtocolError::IdentityStorage("Wrong passphrase or corrupted key".into()))
}
