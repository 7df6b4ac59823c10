//! Filesystem body storage.
//!
//! Each cache key owns one `<key>.body` file under the root directory. Writes
//! go to a sibling temp file which is renamed over the final name, so readers
//! observe either the previous body or the new one in full.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};
use tracing::warn;
use uuid::Uuid;

pub const BODY_SUFFIX: &str = ".body";
/// Combined metadata+body files written by older deployments; swept, never written.
pub const LEGACY_SUFFIX: &str = ".cache";
const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache key `{0}` cannot be used as a file name")]
    InvalidKey(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct BodyStore {
    root: PathBuf,
}

impl BodyStore {
    /// Open storage rooted at `root`, creating the directory if necessary.
    pub fn new(root: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the body file for `key`.
    pub fn body_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(format!("{key}{BODY_SUFFIX}")))
    }

    /// Write `content` as the body of `key`, atomically replacing any previous body.
    pub async fn write(&self, key: &str, content: &[u8]) -> Result<PathBuf, StoreError> {
        let final_path = self.body_path(key)?;
        let temp_path = self
            .root
            .join(format!("{key}{BODY_SUFFIX}.{}{TEMP_SUFFIX}", Uuid::new_v4()));

        if let Err(err) = write_file(&temp_path, content).await {
            discard(&temp_path).await;
            return Err(err.into());
        }

        if let Err(err) = fs::rename(&temp_path, &final_path).await {
            discard(&temp_path).await;
            return Err(err.into());
        }

        Ok(final_path)
    }

    pub async fn read(&self, path: &Path) -> Result<Bytes, StoreError> {
        let data = fs::read(path).await?;
        Ok(Bytes::from(data))
    }

    pub async fn open(&self, path: &Path) -> Result<fs::File, StoreError> {
        Ok(fs::File::open(path).await?)
    }

    /// Whether a body file is present. I/O errors count as absent.
    pub async fn exists(&self, path: &Path) -> bool {
        matches!(fs::try_exists(path).await, Ok(true))
    }

    /// Delete every body, legacy and temp file whose name starts with `prefix`.
    ///
    /// Files that vanish concurrently are not failures. Every candidate is
    /// attempted; the first real failure is returned afterwards.
    pub async fn remove_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut removed = 0;
        let mut first_error = None;

        while let Some(entry) = dir.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if !is_swept(name, prefix) {
                continue;
            }

            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(
                        op = "store::remove_prefix",
                        result = "error",
                        file = name,
                        error = %err,
                        "Failed to delete cached body"
                    );
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(removed),
        }
    }
}

fn is_swept(name: &str, prefix: &str) -> bool {
    name.starts_with(prefix)
        && (name.ends_with(BODY_SUFFIX) || name.ends_with(LEGACY_SUFFIX) || name.ends_with(TEMP_SUFFIX))
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    let unsafe_key = key.is_empty()
        || key == "."
        || key.contains("..")
        || key.contains(['/', '\\', '\0']);
    if unsafe_key {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

async fn write_file(path: &Path, content: &[u8]) -> Result<(), std::io::Error> {
    let mut file = fs::File::create(path).await?;
    file.write_all(content).await?;
    file.flush().await?;
    file.sync_all().await
}

async fn discard(path: &Path) {
    if let Err(err) = fs::remove_file(path).await
        && err.kind() != ErrorKind::NotFound
    {
        warn!(
            op = "store::discard",
            result = "error",
            path = %path.display(),
            error = %err,
            "Failed to remove temporary body file"
        );
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn rejects_keys_that_escape_the_root() {
        let dir = TempDir::new().expect("temp dir");
        let store = BodyStore::new(dir.path().to_path_buf()).expect("store");

        for key in ["", "..", "../etc/passwd", "a/b", "a\\b", "nul\0"] {
            assert!(
                matches!(store.body_path(key), Err(StoreError::InvalidKey(_))),
                "key {key:?} should be rejected"
            );
        }
        assert!(store.body_path("user_123_data").is_ok());
    }

    #[tokio::test]
    async fn write_replaces_previous_body_and_leaves_no_temp_files() {
        let dir = TempDir::new().expect("temp dir");
        let store = BodyStore::new(dir.path().to_path_buf()).expect("store");

        store.write("page", b"first version").await.expect("first write");
        let path = store.write("page", b"second").await.expect("second write");

        assert_eq!(&store.read(&path).await.expect("read")[..], b"second");

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .expect("list root")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["page.body".to_string()]);
    }

    #[tokio::test]
    async fn remove_prefix_sweeps_current_and_legacy_files() {
        let dir = TempDir::new().expect("temp dir");
        let store = BodyStore::new(dir.path().to_path_buf()).expect("store");

        store.write("user_123_data", b"a").await.expect("write");
        store.write("user_456_data", b"b").await.expect("write");
        std::fs::write(dir.path().join("user_123_profile_meta.cache"), b"legacy").expect("legacy");
        std::fs::write(dir.path().join("user_123_notes.txt"), b"keep").expect("unrelated");

        let removed = store.remove_prefix("user_123").await.expect("sweep");
        assert_eq!(removed, 2);

        assert!(!dir.path().join("user_123_data.body").exists());
        assert!(!dir.path().join("user_123_profile_meta.cache").exists());
        assert!(dir.path().join("user_456_data.body").exists());
        assert!(dir.path().join("user_123_notes.txt").exists());
    }

    #[tokio::test]
    async fn remove_prefix_on_missing_root_is_a_no_op() {
        let dir = TempDir::new().expect("temp dir");
        let root = dir.path().join("cache");
        let store = BodyStore::new(root.clone()).expect("store");
        std::fs::remove_dir(&root).expect("remove root");

        assert_eq!(store.remove_prefix("").await.expect("sweep"), 0);
    }
}
