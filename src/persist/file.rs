use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::PersistenceAdapter;
use crate::error::AdapterError;

/// Adapter that keeps every key in one JSON document on disk.
///
/// The document is read on first use and rewritten (temp file + rename) on
/// every change, so a crash mid-write leaves the previous version intact.
#[derive(Debug)]
pub struct FileAdapter {
    path: PathBuf,
    document: Mutex<Option<BTreeMap<String, String>>>,
}

impl FileAdapter {
    /// Use the document at `path`. The file need not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            document: Mutex::new(None),
        }
    }

    /// Location of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(path: &Path) -> Result<BTreeMap<String, String>, AdapterError> {
        match tokio::fs::read(path).await {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save(&self, document: &BTreeMap<String, String>) -> Result<(), AdapterError> {
        let bytes = serde_json::to_vec_pretty(document)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceAdapter for FileAdapter {
    async fn get(&self, key: &str) -> Result<Option<String>, AdapterError> {
        let mut document = self.document.lock().await;
        if document.is_none() {
            *document = Some(Self::load(&self.path).await?);
        }
        Ok(document.as_ref().and_then(|doc| doc.get(key).cloned()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), AdapterError> {
        let mut document = self.document.lock().await;
        let mut current = match document.take() {
            Some(doc) => doc,
            None => Self::load(&self.path).await?,
        };
        current.insert(key.to_owned(), value.to_owned());
        let saved = self.save(&current).await;
        *document = Some(current);
        saved
    }

    async fn remove(&self, key: &str) -> Result<(), AdapterError> {
        let mut document = self.document.lock().await;
        let mut current = match document.take() {
            Some(doc) => doc,
            None => Self::load(&self.path).await?,
        };
        let existed = current.remove(key).is_some();
        let saved = if existed {
            self.save(&current).await
        } else {
            Ok(())
        };
        *document = Some(current);
        saved
    }

    async fn keys(&self) -> Result<Vec<String>, AdapterError> {
        let mut document = self.document.lock().await;
        if document.is_none() {
            *document = Some(Self::load(&self.path).await?);
        }
        Ok(document
            .as_ref()
            .map(|doc| doc.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("store.json");

        let adapter = FileAdapter::new(&path);
        adapter.set("@store:a::b", "{\"x\":1}").await.unwrap();
        adapter.set("@store:a::c", "2").await.unwrap();
        adapter.remove("@store:a::c").await.unwrap();

        let reopened = FileAdapter::new(&path);
        assert_eq!(
            reopened.get("@store:a::b").await.unwrap().as_deref(),
            Some("{\"x\":1}")
        );
        assert_eq!(reopened.keys().await.unwrap(), vec!["@store:a::b"]);
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FileAdapter::new(dir.path().join("absent.json"));
        assert_eq!(adapter.get("k").await.unwrap(), None);
        assert!(adapter.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "not json").unwrap();

        let adapter = FileAdapter::new(&path);
        assert!(matches!(
            adapter.get("k").await,
            Err(AdapterError::Serialization(_))
        ));
    }
}
