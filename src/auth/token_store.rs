use super::types::{AuthError, Token};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File name of the cached token record
const TOKEN_FILE_NAME: &str = "token_cache.json";

/// On-disk cache holding a single token record.
///
/// There is no cross-process locking: concurrent readers may observe a stale
/// record and the last writer wins. Anything unreadable is reported as "no
/// token" so the caller re-authenticates instead of failing.
pub struct TokenStore {
    storage_path: PathBuf,
    encryption_key: Option<[u8; 32]>,
}

impl TokenStore {
    /// Create a token store at `storage_path`, sealing records with
    /// AES-256-GCM when a key is given
    pub fn new(storage_path: PathBuf, encryption_key: Option<[u8; 32]>) -> Self {
        Self {
            storage_path,
            encryption_key,
        }
    }

    /// Default per-user location: <config dir>/meta-ads-mcp/token_cache.json
    pub fn default_path() -> Result<PathBuf, AuthError> {
        let config_dir = dirs::config_dir().ok_or_else(|| {
            AuthError::TokenStorageError("Could not determine config directory".to_string())
        })?;

        Ok(config_dir.join("meta-ads-mcp").join(TOKEN_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.storage_path
    }

    /// Load the cached token.
    ///
    /// Returns `None` when the record is missing, corrupt, undecryptable, or
    /// past its known expiry.
    pub fn load(&self) -> Option<Token> {
        match self.read_record() {
            Ok(Some(token)) if token.is_expired() => {
                debug!(
                    source = ?token.source,
                    expires_at = ?token.expires_at,
                    "Cached token is expired"
                );
                None
            }
            Ok(token) => token,
            Err(e) => {
                warn!(
                    path = %self.storage_path.display(),
                    error = %e,
                    "Ignoring unreadable token cache"
                );
                None
            }
        }
    }

    /// Persist a token, replacing any previous record
    pub fn save(&self, token: &Token) -> Result<(), AuthError> {
        if let Some(parent) = self.storage_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                AuthError::TokenStorageError(format!("Failed to create storage directory: {}", e))
            })?;
        }

        let json = serde_json::to_vec(token)
            .map_err(|e| AuthError::TokenStorageError(format!("Failed to serialize token: {}", e)))?;

        let bytes = match &self.encryption_key {
            Some(key) => encrypt(key, &json)?,
            None => json,
        };

        // Write next to the target, then rename over it
        let tmp_path = self.storage_path.with_extension("json.tmp");
        write_private(&tmp_path, &bytes)
            .and_then(|_| fs::rename(&tmp_path, &self.storage_path))
            .map_err(|e| AuthError::TokenStorageError(format!("Failed to write token: {}", e)))?;

        info!(
            source = ?token.source,
            expires_at = ?token.expires_at,
            "Token cached"
        );
        Ok(())
    }

    /// Delete the cached token
    pub fn invalidate(&self) -> Result<(), AuthError> {
        match fs::remove_file(&self.storage_path) {
            Ok(()) => {
                info!("Cached token invalidated");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AuthError::TokenStorageError(format!(
                "Failed to remove token: {}",
                e
            ))),
        }
    }

    fn read_record(&self) -> Result<Option<Token>, AuthError> {
        let bytes = match fs::read(&self.storage_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AuthError::TokenStorageError(format!(
                    "Failed to read token: {}",
                    e
                )))
            }
        };

        let json = match &self.encryption_key {
            Some(key) => decrypt(key, &bytes)?,
            None => bytes,
        };

        let token = serde_json::from_slice(&json)
            .map_err(|e| AuthError::TokenStorageError(format!("Corrupt token record: {}", e)))?;

        Ok(Some(token))
    }
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn sealing_key(key: &[u8; 32]) -> Result<LessSafeKey, AuthError> {
    let unbound = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| AuthError::EncryptionError("Failed to create encryption key".to_string()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Seal with AES-256-GCM; output is `nonce || ciphertext || tag`
fn encrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, AuthError> {
    let key = sealing_key(key)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| AuthError::EncryptionError("Failed to generate nonce".to_string()))?;

    let mut in_out = data.to_vec();
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::empty(),
        &mut in_out,
    )
    .map_err(|_| AuthError::EncryptionError("Encryption failed".to_string()))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&in_out);
    Ok(sealed)
}

fn decrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, AuthError> {
    if data.len() < NONCE_LEN {
        return Err(AuthError::EncryptionError(
            "Sealed record is truncated".to_string(),
        ));
    }

    let key = sealing_key(key)?;
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
        .map_err(|_| AuthError::EncryptionError("Invalid nonce".to_string()))?;

    let mut in_out = ciphertext.to_vec();
    let plaintext = key
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| AuthError::EncryptionError("Decryption failed".to_string()))?;

    Ok(plaintext.to_vec())
}
