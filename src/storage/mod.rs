use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, sync::Arc};
use tokio::{fs::File, io::AsyncWriteExt, sync::RwLock};
use tracing::{debug, info};

pub const CALL_HISTORY_KEY: &str = "call_history";
pub const CREATED_ROOMS_KEY: &str = "created_rooms";
pub const ROOM_META_KEY: &str = "room_meta";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Memory,
    Local { path: String },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Local {
            path: "storage".to_string(),
        }
    }
}

/// Durable key/value storage owned by the engine.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: String) -> Result<()>;
}

pub type KeyValueStoreRef = Arc<dyn KeyValueStore>;

pub fn create_store(config: &StorageConfig) -> Result<KeyValueStoreRef> {
    match config {
        StorageConfig::Memory => Ok(Arc::new(MemoryStore::default())),
        StorageConfig::Local { path } => Ok(Arc::new(FileStore::new(path)?)),
    }
}

#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, String>>,
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        self.values.write().await.insert(key.to_string(), value);
        Ok(())
    }
}

/// One `<key>.json` file per key under a root directory.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(path: &str) -> Result<Self> {
        let root = PathBuf::from(path);
        if !root.exists() {
            std::fs::create_dir_all(&root)
                .with_context(|| format!("create storage directory {}", path))?;
            info!("created storage directory: {}", path);
        }
        Ok(Self { root })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.root.join(safe).with_extension("json")
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.key_path(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        let path = self.key_path(key);
        let tmp = path.with_extension("json.tmp");
        let mut file = File::create(&tmp)
            .await
            .with_context(|| format!("create {}", tmp.display()))?;
        file.write_all(value.as_bytes()).await?;
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("rename {}", path.display()))?;
        debug!(key, bytes = value.len(), "storage written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_memory_store() -> Result<()> {
        let store = MemoryStore::default();
        assert_eq!(store.get(CALL_HISTORY_KEY).await?, None);
        store.put(CALL_HISTORY_KEY, "[]".to_string()).await?;
        assert_eq!(store.get(CALL_HISTORY_KEY).await?, Some("[]".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").to_string_lossy().to_string();
        let config = StorageConfig::Local { path: path.clone() };
        let store = create_store(&config)?;

        assert_eq!(store.get(ROOM_META_KEY).await?, None);
        store
            .put(ROOM_META_KEY, r#"{"booth-1":{"displayName":"Ana"}}"#.to_string())
            .await?;
        store.put(ROOM_META_KEY, r#"{}"#.to_string()).await?;

        assert_eq!(store.get(ROOM_META_KEY).await?, Some("{}".to_string()));
        assert!(PathBuf::from(&path).join("room_meta.json").exists());
        assert!(!PathBuf::from(&path).join("room_meta.json.tmp").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_file_store_sanitizes_keys() -> Result<()> {
        let dir = tempdir()?;
        let store = FileStore::new(dir.path().to_str().unwrap())?;
        store.put("../escape", "x".to_string()).await?;
        assert!(dir.path().join("___escape.json").exists());
        assert_eq!(store.get("../escape").await?, Some("x".to_string()));
        Ok(())
    }
}
