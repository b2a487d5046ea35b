// Persisted RSA identity used to answer AUTH challenges and to build the
// client certificate for STLS.
use super::error::{AdbError, AdbResult};
use rsa::pkcs1v15::Pkcs1v15Sign;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const DEFAULT_KEY_BITS: usize = 2048;
/// AUTH tokens are SHA-1 sized and are signed as if they were the digest.
pub const TOKEN_LEN: usize = 20;

pub struct AdbKey {
    label: String,
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl std::fmt::Debug for AdbKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdbKey")
            .field("label", &self.label)
            .field("modulus_bytes", &rsa::traits::PublicKeyParts::size(&self.public_key))
            .finish_non_exhaustive()
    }
}

impl AdbKey {
    pub fn generate(label: &str, bits: usize) -> AdbResult<Self> {
        let mut rng = rsa::rand_core::OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| AdbError::key_failure(format!("RSA generation failed: {e}")))?;
        Ok(Self::from_private(label, private_key))
    }

    pub fn from_pem(label: &str, pem: &str) -> AdbResult<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| AdbError::key_failure(format!("stored key is not PKCS#8 RSA: {e}")))?;
        Ok(Self::from_private(label, private_key))
    }

    fn from_private(label: &str, private_key: RsaPrivateKey) -> Self {
        let public_key = RsaPublicKey::from(&private_key);
        Self {
            label: label.to_string(),
            private_key,
            public_key,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// Signs an AUTH token. adbd verifies with `RSA_verify(NID_sha1, token)`,
    /// so the token is the digest and must not be hashed again.
    pub fn sign_token(&self, token: &[u8]) -> AdbResult<Vec<u8>> {
        if token.len() != TOKEN_LEN {
            return Err(AdbError::violation(format!(
                "AUTH token is {} bytes, expected {TOKEN_LEN}",
                token.len()
            )));
        }
        self.private_key
            .sign(Pkcs1v15Sign::new::<Sha1>(), token)
            .map_err(|e| AdbError::key_failure(format!("signing failed: {e}")))
    }

    pub fn private_key_pem(&self) -> AdbResult<String> {
        self.private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map(|pem| pem.as_str().to_owned())
            .map_err(|e| AdbError::key_failure(format!("failed to encode private key: {e}")))
    }

    /// PKCS#8 DER of the private key, as rustls and rcgen expect it.
    pub fn private_key_pkcs8_der(&self) -> AdbResult<Vec<u8>> {
        self.private_key
            .to_pkcs8_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| AdbError::key_failure(format!("failed to encode private key: {e}")))
    }

    pub fn public_key_pem(&self) -> AdbResult<String> {
        self.public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AdbError::key_failure(format!("failed to encode public key: {e}")))
    }
}

/// Where the key pair lives between runs.
pub trait KeyStore: Send + Sync {
    fn load(&self) -> AdbResult<Option<String>>;
    fn save(&self, pem: &str) -> AdbResult<()>;
    fn clear(&self) -> AdbResult<()>;
}

/// PEM file on disk, next to the regular adb keys by default.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.android/<file_name>`
    pub fn in_android_home(file_name: &str) -> AdbResult<Self> {
        homedir::my_home()
            .ok()
            .flatten()
            .map(|home| Self::new(home.join(".android").join(file_name)))
            .ok_or(AdbError::HomeDirectoryNotFound)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn store_error(&self, source: std::io::Error) -> AdbError {
        AdbError::KeyStore {
            path: self.path.clone(),
            source,
        }
    }
}

impl KeyStore for FileKeyStore {
    fn load(&self) -> AdbResult<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(pem) => Ok(Some(pem)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.store_error(e)),
        }
    }

    fn save(&self, pem: &str) -> AdbResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.store_error(e))?;
        }
        std::fs::write(&self.path, pem).map_err(|e| self.store_error(e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| self.store_error(e))?;
        }
        Ok(())
    }

    fn clear(&self) -> AdbResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.store_error(e)),
        }
    }
}

/// Hands out the install's single key pair, creating it on first use.
pub struct AdbKeyProvider {
    store: Box<dyn KeyStore>,
    label: String,
    bits: usize,
    cached: Mutex<Option<Arc<AdbKey>>>,
}

impl AdbKeyProvider {
    pub fn new(store: Box<dyn KeyStore>, label: impl Into<String>) -> Self {
        Self::with_bits(store, label, DEFAULT_KEY_BITS)
    }

    pub fn with_bits(store: Box<dyn KeyStore>, label: impl Into<String>, bits: usize) -> Self {
        Self {
            store,
            label: label.into(),
            bits,
            cached: Mutex::new(None),
        }
    }

    /// Loads the persisted key, or generates and persists one. Every failure
    /// surfaces as a key error; the attempt cannot continue without a key.
    pub fn get(&self) -> AdbResult<Arc<AdbKey>> {
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(key) = cached.as_ref() {
            return Ok(Arc::clone(key));
        }

        let key = match self.store.load().map_err(as_key_failure)? {
            Some(pem) => {
                log::debug!("🔑 Loaded persisted ADB key '{}'", self.label);
                AdbKey::from_pem(&self.label, &pem)?
            }
            None => {
                log::info!("🔑 Generating {}-bit ADB key '{}'", self.bits, self.label);
                let key = AdbKey::generate(&self.label, self.bits)?;
                self.store
                    .save(&key.private_key_pem()?)
                    .map_err(as_key_failure)?;
                key
            }
        };

        let key = Arc::new(key);
        *cached = Some(Arc::clone(&key));
        Ok(key)
    }

    /// Explicit external reset: forgets the key so the next `get` makes a new one.
    pub fn reset(&self) -> AdbResult<()> {
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        self.store.clear()?;
        *cached = None;
        Ok(())
    }
}

fn as_key_failure(err: AdbError) -> AdbError {
    match err {
        AdbError::KeyGenerationFailed { .. } => err,
        other => AdbError::key_failure(other),
    }
}
