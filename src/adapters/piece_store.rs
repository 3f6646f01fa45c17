//! Piece Store Adapters
//!
//! Implements the `PieceStore` port over memory and over a local directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use crate::domain::ports::PieceStore;
use crate::error::{Error, Result};

fn slice(data: &Bytes, key: &str, offset: i64, limit: i64) -> Result<Bytes> {
    let len = data.len() as i64;
    if offset < 0 || limit < 0 || offset > len {
        return Err(Error::PieceStore(format!(
            "invalid range offset={} limit={} for piece {} of {} bytes",
            offset, limit, key, len
        )));
    }
    let end = if limit == 0 {
        len
    } else {
        offset.saturating_add(limit).min(len)
    };
    Ok(data.slice(offset as usize..end as usize))
}

/// In-memory piece store for tests and development.
#[derive(Debug, Default)]
pub struct InMemoryPieceStore {
    pieces: DashMap<String, Bytes>,
}

impl InMemoryPieceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.pieces.contains_key(key)
    }

    /// Keys currently stored, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.pieces.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl PieceStore for InMemoryPieceStore {
    async fn get_piece(&self, key: &str, offset: i64, limit: i64) -> Result<Bytes> {
        let data = self
            .pieces
            .get(key)
            .map(|d| d.clone())
            .ok_or_else(|| Error::PieceStore(format!("piece {} not found", key)))?;
        slice(&data, key, offset, limit)
    }

    async fn put_piece(&self, key: &str, data: Bytes) -> Result<()> {
        self.pieces.insert(key.to_string(), data);
        Ok(())
    }

    async fn delete_piece(&self, key: &str) -> Result<()> {
        self.pieces.remove(key);
        Ok(())
    }
}

/// Piece store keeping one file per piece under a root directory.
#[derive(Debug, Clone)]
pub struct LocalFsPieceStore {
    root: PathBuf,
}

impl LocalFsPieceStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::PieceStore(format!("create {}: {}", root.display(), e)))?;
        Ok(Self { root })
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(Error::PieceStore(format!("illegal piece key {:?}", key)));
        }
        Ok(self.root.join(key))
    }

    /// Keys of every stored piece, sorted.
    pub async fn list_keys(&self) -> Result<Vec<String>> {
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| Error::PieceStore(e.to_string()))?;
        let mut keys = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| Error::PieceStore(e.to_string()))?
        {
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    keys.push(name.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl PieceStore for LocalFsPieceStore {
    async fn get_piece(&self, key: &str, offset: i64, limit: i64) -> Result<Bytes> {
        let path = self.path(key)?;
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::PieceStore(format!("read {}: {}", key, e)))?;
        slice(&Bytes::from(data), key, offset, limit)
    }

    async fn put_piece(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path(key)?;
        let tmp = self.root.join(format!(".{}.tmp", key));
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| Error::PieceStore(format!("write {}: {}", key, e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::PieceStore(format!("rename {}: {}", key, e)))?;
        debug!(key, size = data.len(), "piece stored");
        Ok(())
    }

    async fn delete_piece(&self, key: &str) -> Result<()> {
        let path = self.path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::PieceStore(format!("delete {}: {}", key, e))),
        }
    }
}
