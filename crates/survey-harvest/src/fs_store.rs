//! Filesystem-backed [`ObjectStore`].
//!
//! Objects are plain files under a root directory. Writes go to a
//! temporary sibling and are renamed into place, so a crash mid-write
//! never leaves a half-written payload or checkpoint behind. Appends are
//! used only for the JSONL ledgers, whose readers tolerate a torn final
//! line.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

use survey_harvest_core::error::StoreError;
use survey_harvest_core::store::{check_path, ObjectStore};

const TMP_MARKER: &str = ".tmp-";

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StoreError> {
        check_path(path)?;
        Ok(self.root.join(path))
    }

    async fn ensure_parent(&self, full: &Path, path: &str) -> Result<(), StoreError> {
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(path, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn write_bytes(&self, path: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let full = self.resolve(path)?;
        self.ensure_parent(&full, path).await?;

        let mut tmp_name = full.clone().into_os_string();
        tmp_name.push(format!("{}{}", TMP_MARKER, uuid::Uuid::new_v4().simple()));
        let tmp = PathBuf::from(tmp_name);

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        file.sync_all().await.map_err(|e| StoreError::io(path, e))?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp, &full).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StoreError::io(path, e));
        }
        Ok(())
    }

    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(path.to_string()))
            }
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let full = self.resolve(path)?;
        tokio::fs::try_exists(&full)
            .await
            .map_err(|e| StoreError::io(path, e))
    }

    async fn append_bytes(&self, path: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let full = self.resolve(path)?;
        self.ensure_parent(&full, path).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&full)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        file.flush().await.map_err(|e| StoreError::io(path, e))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        // Only walk the deepest directory the prefix pins down.
        let dir = match prefix.rfind('/') {
            Some(i) => self.resolve(&prefix[..i])?,
            None => self.root.clone(),
        };
        let root = self.root.clone();
        let wanted = prefix.to_string();

        let listed = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            if !dir.exists() {
                return out;
            }
            for entry in WalkDir::new(&dir).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let rel = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if rel.starts_with(&wanted) && !rel.contains(TMP_MARKER) {
                    out.push(rel);
                }
            }
            out.sort();
            out
        })
        .await
        .map_err(|e| StoreError::io(prefix, std::io::Error::other(e)))?;

        Ok(listed)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StoreError> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        if !tokio::fs::try_exists(&src)
            .await
            .map_err(|e| StoreError::io(from, e))?
        {
            return Err(StoreError::NotFound(from.to_string()));
        }
        self.ensure_parent(&dst, to).await?;
        tokio::fs::rename(&src, &dst)
            .await
            .map_err(|e| StoreError::io(to, e))
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }
}
