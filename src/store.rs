//! Durable plugin records.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::lifecycle::PluginStatus;
use crate::plugin::LoadedPlugin;

/// Integrity data captured at load time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    /// Plugin directory.
    pub path: PathBuf,
    /// Recursive directory size.
    pub file_size_bytes: u64,
    /// Hex SHA-256 of manifest and main file.
    pub checksum: String,
}

impl From<&LoadedPlugin> for RecordMetadata {
    fn from(loaded: &LoadedPlugin) -> Self {
        Self {
            path: loaded.path.clone(),
            file_size_bytes: loaded.size_bytes,
            checksum: loaded.checksum.clone(),
        }
    }
}

/// Persisted state of one plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRecord {
    /// Plugin name.
    pub name: String,
    /// Installed version.
    pub version: String,
    /// Last persisted status.
    pub status: PluginStatus,
    /// Plugin settings.
    #[serde(default)]
    pub settings: Value,
    /// First install time.
    pub installed_at: DateTime<Utc>,
    /// Last activation time.
    #[serde(default)]
    pub activated_at: Option<DateTime<Utc>>,
    /// Last modification time.
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    /// Message of the last failure.
    #[serde(default)]
    pub error_message: Option<String>,
    /// Integrity data.
    pub metadata: RecordMetadata,
}

impl PluginRecord {
    /// Create a fresh record.
    pub fn new(name: impl Into<String>, version: impl Into<String>, status: PluginStatus) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            status,
            settings: Value::Object(Default::default()),
            installed_at: Utc::now(),
            activated_at: None,
            last_updated: None,
            error_message: None,
            metadata: RecordMetadata::default(),
        }
    }

    /// Set the settings document.
    pub fn with_settings(mut self, settings: Value) -> Self {
        self.settings = settings;
        self
    }

    /// Set the integrity data.
    pub fn with_metadata(mut self, metadata: RecordMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    fn apply_status(&mut self, status: PluginStatus, error_message: Option<String>) {
        let now = Utc::now();
        if status == PluginStatus::Active {
            self.activated_at = Some(now);
        }
        self.status = status;
        self.error_message = error_message;
        self.last_updated = Some(now);
    }
}

/// Durable storage for plugin records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Get a record.
    async fn get(&self, name: &str) -> Result<Option<PluginRecord>>;

    /// All records, sorted by name.
    async fn list(&self) -> Result<Vec<PluginRecord>>;

    /// Insert or replace a record.
    async fn upsert(&self, record: PluginRecord) -> Result<()>;

    /// Change status and error message. Fails if the record is absent.
    async fn update_status(&self, name: &str, status: PluginStatus, error_message: Option<String>) -> Result<()>;

    /// Delete a record. Returns whether one existed.
    async fn delete(&self, name: &str) -> Result<bool>;
}

/// Record store kept in memory.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: DashMap<String, PluginRecord>,
}

impl MemoryRecordStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, name: &str) -> Result<Option<PluginRecord>> {
        Ok(self.records.get(name).map(|r| r.value().clone()))
    }

    async fn list(&self) -> Result<Vec<PluginRecord>> {
        let mut records: Vec<PluginRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    async fn upsert(&self, record: PluginRecord) -> Result<()> {
        self.records.insert(record.name.clone(), record);
        Ok(())
    }

    async fn update_status(&self, name: &str, status: PluginStatus, error_message: Option<String>) -> Result<()> {
        let mut record = self
            .records
            .get_mut(name)
            .ok_or_else(|| Error::store(format!("no record for {}", name)))?;
        record.apply_status(status, error_message);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.records.remove(name).is_some())
    }
}

/// Record store backed by a single JSON document.
///
/// Every write replaces the file through a temporary sibling and a rename.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, PluginRecord>>,
}

impl JsonFileStore {
    /// Open a store, reading existing records if the file exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records: BTreeMap<String, PluginRecord> = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::store(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        debug!(path = %path.display(), records = records.len(), "Opened record store");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// File backing this store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, records: &BTreeMap<String, PluginRecord>) -> Result<()> {
        let json = serde_json::to_vec_pretty(records).map_err(|e| Error::store(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonFileStore {
    async fn get(&self, name: &str) -> Result<Option<PluginRecord>> {
        Ok(self.records.lock().await.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<PluginRecord>> {
        Ok(self.records.lock().await.values().cloned().collect())
    }

    async fn upsert(&self, record: PluginRecord) -> Result<()> {
        let mut records = self.records.lock().await;
        records.insert(record.name.clone(), record);
        self.persist(&records).await
    }

    async fn update_status(&self, name: &str, status: PluginStatus, error_message: Option<String>) -> Result<()> {
        let mut records = self.records.lock().await;
        records
            .get_mut(name)
            .ok_or_else(|| Error::store(format!("no record for {}", name)))?
            .apply_status(status, error_message);
        self.persist(&records).await
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let mut records = self.records.lock().await;
        if records.remove(name).is_none() {
            return Ok(false);
        }
        self.persist(&records).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryRecordStore::new();
        store
            .upsert(PluginRecord::new("b", "1.0.0", PluginStatus::Installed))
            .await
            .unwrap();
        store
            .upsert(PluginRecord::new("a", "1.0.0", PluginStatus::Installed))
            .await
            .unwrap();

        store.update_status("a", PluginStatus::Active, None).await.unwrap();
        let a = store.get("a").await.unwrap().unwrap();
        assert_eq!(a.status, PluginStatus::Active);
        assert!(a.activated_at.is_some());

        let names: Vec<_> = store.list().await.unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b"]);

        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert!(store.update_status("a", PluginStatus::Error, None).await.is_err());
    }

    #[tokio::test]
    async fn test_json_store_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state").join("plugins.json");

        {
            let store = JsonFileStore::open(&path).await.unwrap();
            let record = PluginRecord::new("seo-helper", "1.0.0", PluginStatus::Installed)
                .with_settings(serde_json::json!({"sitemap": true}));
            store.upsert(record).await.unwrap();
            store
                .update_status("seo-helper", PluginStatus::Error, Some("boom".into()))
                .await
                .unwrap();
        }

        let store = JsonFileStore::open(&path).await.unwrap();
        let record = store.get("seo-helper").await.unwrap().unwrap();
        assert_eq!(record.status, PluginStatus::Error);
        assert_eq!(record.error_message.as_deref(), Some("boom"));
        assert_eq!(record.settings["sitemap"], true);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_json_store_rejects_corrupt_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("plugins.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = JsonFileStore::open(&path).await.unwrap_err();
        assert_eq!(err.code(), "STORE_ERROR");
    }

    #[test]
    fn test_record_serialization() {
        let record = PluginRecord::new("a", "1.0.0", PluginStatus::Active);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "active");
        assert!(json.get("installedAt").is_some());
        assert!(json["metadata"].get("fileSizeBytes").is_some());
    }
}
