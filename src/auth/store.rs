// Local credential store
// Env-style key/value file shared with the setup wizard

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{ClientError, Result};

pub const USERNAME_KEY: &str = "un";
pub const PASSWORD_KEY: &str = "pw";
pub const CERTIFICATE_KEY: &str = "pub_cert";
pub const PRIVATE_KEY_KEY: &str = "priv_key";
pub const CLIENT_ID_KEY: &str = "client_id";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// Key/value backing store for credential material.
///
/// `set` must be durable when it returns: the rotating refresh secret is
/// written here before the access token obtained with it is handed out.
pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Read the current refresh secret, failing if none is stored
pub fn load_refresh_secret(store: &dyn SecretStore) -> Result<String> {
    store
        .get(REFRESH_TOKEN_KEY)?
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            ClientError::Store(format!("no `{}` found in credential store", REFRESH_TOKEN_KEY))
        })
}

/// Env file store (`KEY='value'` per line)
pub struct EnvFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl EnvFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All key/value pairs in the file; empty if the file does not exist
    pub fn entries(&self) -> Result<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let iter = dotenvy::from_path_iter(&self.path).map_err(|e| {
            ClientError::Store(format!("failed to read {}: {}", self.path.display(), e))
        })?;

        let mut entries = HashMap::new();
        for item in iter {
            let (key, value) = item.map_err(|e| {
                ClientError::Store(format!("failed to parse {}: {}", self.path.display(), e))
            })?;
            entries.insert(key, value);
        }
        Ok(entries)
    }
}

impl SecretStore for EnvFileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| ClientError::Store("credential store lock poisoned".to_string()))?;

        let existing = if self.path.exists() {
            std::fs::read_to_string(&self.path)?
        } else {
            String::new()
        };

        let content = upsert_line(&existing, key, value);
        write_atomic(&self.path, content.as_bytes())?;

        tracing::debug!(key = key, path = %self.path.display(), "Credential store updated");
        Ok(())
    }
}

/// In-memory store, for embedding and tests
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(key: &str, value: &str) -> Self {
        let store = Self::new();
        if let Ok(mut values) = store.values.lock() {
            values.insert(key.to_string(), value.to_string());
        }
        store
    }
}

impl SecretStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|_| ClientError::Store("memory store lock poisoned".to_string()))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| ClientError::Store("memory store lock poisoned".to_string()))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Replace `key`'s line, or append one, keeping comments and other keys
fn upsert_line(existing: &str, key: &str, value: &str) -> String {
    let line = format!("{}={}", key, quote_value(value));
    let mut replaced = false;
    let mut lines: Vec<String> = Vec::new();

    for current in existing.lines() {
        let trimmed = current.trim_start();
        let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let matches = trimmed
            .split_once('=')
            .map(|(k, _)| k.trim() == key)
            .unwrap_or(false);

        if matches && !trimmed.starts_with('#') {
            if !replaced {
                lines.push(line.clone());
                replaced = true;
            }
        } else {
            lines.push(current.to_string());
        }
    }

    if !replaced {
        lines.push(line);
    }

    let mut content = lines.join("\n");
    content.push('\n');
    content
}

/// Single quotes keep the value literal; fall back to escaped double quotes
fn quote_value(value: &str) -> String {
    if !value.contains('\'') {
        format!("'{}'", value)
    } else {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{}\"", escaped)
    }
}

/// Write bytes atomically using temp file + rename
fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let temp_path = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("creds"),
        std::process::id()
    ));

    {
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    std::fs::rename(&temp_path, path)?;
    Ok(())
}
