//! Secret store (C3): an encrypted key→value map at rest, behind a
//! pluggable `SecretStore` trait with a local (age-encrypted) backend and
//! a remote REST-KV backend.

use std::collections::BTreeMap;
use std::fs;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

use age::secrecy::ExposeSecret;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("identity already initialized at {0}")]
    AlreadyInitialized(PathBuf),
    #[error("secret {0:?} not found")]
    NotFound(String),
    #[error("identity file is corrupt: {0}")]
    Corrupt(String),
    #[error("encryption failed: {0}")]
    Encrypt(String),
    #[error("decryption failed: {0}")]
    Decrypt(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Abstracts over where secrets live: a local encrypted blob, or a remote
/// REST KV service. The orchestrator borrows an `&dyn SecretStore` for the
/// duration of one execution; no ownership is transferred.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<String, SecretError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), SecretError>;
    async fn delete(&self, key: &str) -> Result<(), SecretError>;
    async fn list(&self) -> Result<Vec<String>, SecretError>;
}

/// A local store: a single age-encrypted JSON blob, decrypted with an
/// identity kept in a 0600 file alongside it.
pub struct LocalSecretStore {
    blob_path: PathBuf,
    identity: age::x25519::Identity,
    recipient: age::x25519::Recipient,
    // serializes decrypt-modify-re-encrypt across concurrent callers
    lock: Mutex<()>,
}

impl LocalSecretStore {
    /// Generates a fresh identity and writes it to `identity_path` (0600).
    /// Fails if the file already exists — identities are never rotated
    /// implicitly.
    pub fn init(identity_path: impl AsRef<Path>) -> Result<age::x25519::Recipient, SecretError> {
        let identity_path = identity_path.as_ref();
        if identity_path.exists() {
            return Err(SecretError::AlreadyInitialized(identity_path.to_path_buf()));
        }
        if let Some(parent) = identity_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let identity = age::x25519::Identity::generate();
        let recipient = identity.to_public();
        let contents = format!(
            "# created by aegisclaw\n# public key: {recipient}\n{}\n",
            identity.to_string().expose_secret()
        );

        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .mode(0o600)
            .open(identity_path)?;
        file.write_all(contents.as_bytes())?;

        Ok(recipient)
    }

    /// Opens a store whose identity already exists at `identity_path`, with
    /// the encrypted blob at `blob_path`.
    pub fn open(
        identity_path: impl AsRef<Path>,
        blob_path: impl Into<PathBuf>,
    ) -> Result<Self, SecretError> {
        let contents = fs::read_to_string(identity_path.as_ref())?;
        let key_line = contents
            .lines()
            .find(|line| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
            .ok_or_else(|| SecretError::Corrupt("no identity line found".to_string()))?;
        let identity = age::x25519::Identity::from_str(key_line.trim())
            .map_err(|e| SecretError::Corrupt(e.to_string()))?;
        let recipient = identity.to_public();

        Ok(Self {
            blob_path: blob_path.into(),
            identity,
            recipient,
            lock: Mutex::new(()),
        })
    }

    fn load_map(&self) -> Result<BTreeMap<String, String>, SecretError> {
        if !self.blob_path.exists() {
            return Ok(BTreeMap::new());
        }
        let file = fs::File::open(&self.blob_path)?;
        let decryptor = match age::Decryptor::new(file).map_err(|e| SecretError::Decrypt(e.to_string()))? {
            age::Decryptor::Recipients(d) => d,
            _ => return Err(SecretError::Corrupt("blob is not recipient-encrypted".to_string())),
        };
        let identity: &dyn age::Identity = &self.identity;
        let mut reader = decryptor
            .decrypt(std::iter::once(identity))
            .map_err(|e| SecretError::Decrypt(e.to_string()))?;
        let mut plaintext = Vec::new();
        reader.read_to_end(&mut plaintext)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    fn save_map(&self, map: &BTreeMap<String, String>) -> Result<(), SecretError> {
        let plaintext = serde_json::to_vec(map)?;
        let recipient: Box<dyn age::Recipient + Send> = Box::new(self.recipient.clone());
        let encryptor = age::Encryptor::with_recipients(vec![recipient])
            .map_err(|e| SecretError::Encrypt(e.to_string()))?;

        let mut ciphertext = Vec::new();
        let mut writer = encryptor
            .wrap_output(&mut ciphertext)
            .map_err(|e| SecretError::Encrypt(e.to_string()))?;
        writer.write_all(&plaintext)?;
        writer.finish().map_err(|e| SecretError::Encrypt(e.to_string()))?;

        let tmp_path = self.blob_path.with_extension("tmp");
        let mut tmp = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .mode(0o600)
            .open(&tmp_path)?;
        tmp.write_all(&ciphertext)?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, &self.blob_path)?;
        Ok(())
    }
}

#[async_trait]
impl SecretStore for LocalSecretStore {
    async fn get(&self, key: &str) -> Result<String, SecretError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let map = self.load_map()?;
        map.get(key).cloned().ok_or_else(|| SecretError::NotFound(key.to_string()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), SecretError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut map = self.load_map()?;
        map.insert(key.to_string(), value.to_string());
        self.save_map(&map)
    }

    async fn delete(&self, key: &str) -> Result<(), SecretError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut map = self.load_map()?;
        map.remove(key);
        self.save_map(&map)
    }

    async fn list(&self) -> Result<Vec<String>, SecretError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        Ok(self.load_map()?.into_keys().collect())
    }
}

/// A remote backend speaking a REST-style KV API with bearer-token auth.
pub struct RemoteSecretStore {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl RemoteSecretStore {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, key: &str) -> String {
        format!("{}/secrets/{key}", self.base_url.trim_end_matches('/'))
    }
}

#[derive(serde::Deserialize)]
struct ValueBody {
    value: String,
}

#[derive(serde::Serialize)]
struct ValueBodyRef<'a> {
    value: &'a str,
}

#[async_trait]
impl SecretStore for RemoteSecretStore {
    async fn get(&self, key: &str) -> Result<String, SecretError> {
        let resp = self
            .client
            .get(self.url(key))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SecretError::NotFound(key.to_string()));
        }
        let body: ValueBody = resp.error_for_status()?.json().await?;
        Ok(body.value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), SecretError> {
        self.client
            .put(self.url(key))
            .bearer_auth(&self.token)
            .json(&ValueBodyRef { value })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SecretError> {
        self.client
            .delete(self.url(key))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, SecretError> {
        #[derive(serde::Deserialize)]
        struct ListBody {
            keys: Vec<String>,
        }
        let body: ListBody = self
            .client
            .get(format!("{}/secrets", self.base_url.trim_end_matches('/')))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body.keys)
    }
}
