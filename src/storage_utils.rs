use serde::{Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};
use tokio::fs;

// STORAGE MANAGER
// JSON documents on local disk: the config, the indicator cache and trained
// models. Nothing here is a database; each document is written whole.

pub struct AsyncStorageManager {
    // Absolute path to the storage directory (e.g. ".../target/debug/storage")
    pub base_dir: PathBuf,
}

impl AsyncStorageManager {
    /// Creates a manager rooted at `base_dir`, creating the directory if needed.
    pub async fn new<P: AsRef<Path>>(base_dir: P) -> anyhow::Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        if !base_dir.exists() {
            fs::create_dir_all(&base_dir).await?;
        }
        Ok(Self { base_dir })
    }

    /// **Constructor: new_relative**
    /// Resolves the storage path relative to the directory of the running
    /// executable.
    pub async fn new_relative<P: AsRef<Path>>(relative_path: P) -> anyhow::Result<Self> {
        let exe_path = std::env::current_exe()?;
        let base_dir = exe_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Could not find binary directory"))?
            .join(relative_path);
        Self::new(base_dir).await
    }

    /// Path of the JSON document `name` (which may contain `/` separators).
    pub fn path_of(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", name))
    }

    pub async fn exists(&self, name: &str) -> bool {
        fs::try_exists(self.path_of(name)).await.unwrap_or(false)
    }

    /// **Generic Save Function**
    /// Serializes `data` as pretty JSON into a `.tmp` sibling, then renames
    /// it into place.
    pub async fn save<T: Serialize>(&self, name: &str, data: &T) -> anyhow::Result<PathBuf> {
        let final_path = self.path_of(name);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp_path = final_path.with_extension("json.tmp");

        let json_bytes = serde_json::to_vec_pretty(data)?;
        fs::write(&tmp_path, json_bytes).await?;
        fs::rename(&tmp_path, &final_path).await?;

        Ok(final_path)
    }

    /// **Generic Load Function**
    pub async fn load<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<T> {
        let content = fs::read(self.path_of(name)).await?;
        let data = serde_json::from_slice(&content)?;
        Ok(data)
    }
}
