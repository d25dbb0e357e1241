use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Bulk object storage holding raw records, addressed by `/`-separated keys.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Every key starting with `prefix`, sorted lexicographically.
    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>>;
    async fn read(&self, key: &str) -> anyhow::Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub key: String,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

#[derive(Debug, Clone)]
pub struct FsRecordStore {
    root: PathBuf,
}

impl FsRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, key: &str) -> anyhow::Result<PathBuf> {
        let key = key.trim_start_matches('/');
        if key.is_empty() || key.split('/').any(|part| part == ".." || part.is_empty()) {
            bail!("invalid record key {key:?}");
        }
        Ok(self.root.join(key))
    }

    /// Write an object through a temp file and rename so readers never see partial content.
    pub async fn put(&self, key: &str, bytes: &[u8]) -> anyhow::Result<StoredObject> {
        let absolute_path = self.resolve(key)?;
        let Some(parent) = absolute_path.parent() else {
            bail!("record key {key:?} has no parent directory");
        };
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating record directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp record file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp record file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp record file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp record {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredObject {
            key: key.trim_start_matches('/').to_string(),
            absolute_path,
            byte_size: bytes.len(),
        })
    }

    async fn walk(&self) -> anyhow::Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("listing {}", dir.display()));
                }
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .with_context(|| format!("reading entry in {}", dir.display()))?
            {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/");
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl RecordStore for FsRecordStore {
    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let prefix = prefix.trim_start_matches('/');
        let mut keys: Vec<String> = self
            .walk()
            .await?
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn read(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.resolve(key)?;
        fs::read(&path)
            .await
            .with_context(|| format!("reading record {}", path.display()))
    }
}
