use bytes::Bytes;
use std::path::{Path, PathBuf};

use super::{BackendError, Locator};

/// Local filesystem backend. Objects are flat files named by a random key.
pub struct LocalStore {
    base_path: PathBuf,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, std::io::Error> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    /// Resolve a locator to a path, refusing anything that could escape the root.
    fn object_path(&self, locator: &Locator) -> Result<PathBuf, BackendError> {
        let key = locator.as_str();
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(BackendError::NotFound(key.to_string()));
        }
        Ok(self.base_path.join(key))
    }

    /// Write to a hidden temp file, then rename into place so readers never see a
    /// partial object.
    pub async fn put(&self, data: Bytes) -> Result<Locator, BackendError> {
        let key = uuid::Uuid::new_v4().simple().to_string();
        let final_path = self.base_path.join(&key);
        let temp_path = self.base_path.join(format!(".{key}.tmp"));

        if let Err(e) = tokio::fs::write(&temp_path, &data).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        tokio::fs::rename(&temp_path, &final_path).await?;

        Ok(Locator::new(key))
    }

    pub async fn get(&self, locator: &Locator) -> Result<Bytes, BackendError> {
        let path = self.object_path(locator)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackendError::NotFound(locator.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(&self, locator: &Locator) -> Result<bool, BackendError> {
        let path = match self.object_path(locator) {
            Ok(path) => path,
            Err(_) => return Ok(false),
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, locator: &Locator) -> Result<bool, BackendError> {
        let path = match self.object_path(locator) {
            Ok(path) => path,
            Err(_) => return Ok(false),
        };
        Ok(tokio::fs::try_exists(&path).await?)
    }

    /// Number of committed objects (temp files excluded).
    pub fn object_count(&self) -> Result<usize, std::io::Error> {
        let mut count = 0;
        for entry in std::fs::read_dir(&self.base_path)? {
            let entry = entry?;
            if !entry.file_name().to_string_lossy().starts_with('.') {
                count += 1;
            }
        }
        Ok(count)
    }
}
