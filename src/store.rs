use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use url::Url;
use uuid::Uuid;

use crate::{Error, Result};

const LOG_PREFIX: &str = "[store]";

/// Durable home for received payloads.
pub trait ResourceStore: Send + Sync {
    /// Moves the completely received payload at `staged` somewhere durable
    /// and returns its location. `resource_id` is informational only; it is
    /// chosen by the remote sender and never used as a file name.
    fn persist(&self, staged: &Path, resource_id: &str) -> Result<Url>;
}

/// Stores every received resource as a uniquely named file in one directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ResourceStore for DirectoryStore {
    fn persist(&self, staged: &Path, resource_id: &str) -> Result<Url> {
        fs::create_dir_all(&self.root)?;
        let root = fs::canonicalize(&self.root)?;

        let mut source = File::open(staged)?;
        let mut temp = TmpFile::create_in(&root)?;
        io::copy(&mut source, &mut temp)?;

        let target = root.join(Uuid::new_v4().to_string());
        temp.persist(&target)?;
        log::info!(
            "{LOG_PREFIX} moved resource '{resource_id}' from {} to {}",
            staged.display(),
            target.display()
        );

        if let Err(err) = fs::remove_file(staged) {
            log::warn!(
                "{LOG_PREFIX} could not remove staged file {}: {err}",
                staged.display()
            );
        }

        Url::from_file_path(&target).map_err(|_| {
            Error::Other(anyhow::anyhow!(
                "not an absolute path: {}",
                target.display()
            ))
        })
    }
}

/// Temporary file that is removed unless it gets persisted.
struct TmpFile {
    file: File,
    path: PathBuf,
    persisted: bool,
}

impl TmpFile {
    fn create_in(temp_dir: impl AsRef<Path>) -> io::Result<Self> {
        let filename: String = std::iter::once('.')
            .chain(std::iter::repeat_with(fastrand::alphanumeric).take(10))
            .collect();
        let path = temp_dir.as_ref().join(filename);
        let file = File::create(&path)?;
        Ok(Self {
            file,
            path,
            persisted: false,
        })
    }

    /// Flushes the content to disk and renames the file to `target`.
    fn persist(mut self, target: &Path) -> io::Result<()> {
        self.file.sync_data()?;
        fs::rename(&self.path, target)?;
        self.persisted = true;
        Ok(())
    }
}

impl Write for TmpFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Drop for TmpFile {
    fn drop(&mut self) {
        if !self.persisted {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn persists_into_root_and_removes_staged_file() {
        let staging = TempDir::new().unwrap();
        let storage = TempDir::new().unwrap();
        let staged = staging.path().join("incoming");
        fs::write(&staged, b"alpha content").unwrap();

        let store = DirectoryStore::new(storage.path());
        let location = store.persist(&staged, "alpha").unwrap();

        let path = location.to_file_path().unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"alpha content");
        assert_eq!(
            path.parent().unwrap(),
            fs::canonicalize(storage.path()).unwrap()
        );
        assert!(!staged.exists());
    }

    #[test]
    fn creates_missing_root() {
        let staging = TempDir::new().unwrap();
        let storage = TempDir::new().unwrap();
        let root = storage.path().join("nested").join("received");
        let staged = staging.path().join("incoming");
        fs::write(&staged, b"beta").unwrap();

        let store = DirectoryStore::new(&root);
        assert_eq!(store.root(), root.as_path());
        let location = store.persist(&staged, "beta").unwrap();
        assert!(location.to_file_path().unwrap().starts_with(
            fs::canonicalize(&root).unwrap()
        ));
    }

    #[test]
    fn each_resource_gets_its_own_file() {
        let staging = TempDir::new().unwrap();
        let storage = TempDir::new().unwrap();
        let store = DirectoryStore::new(storage.path());

        let mut locations = Vec::new();
        for content in ["one", "two"] {
            let staged = staging.path().join(content);
            fs::write(&staged, content).unwrap();
            locations.push(store.persist(&staged, "same-id").unwrap());
        }

        assert_ne!(locations[0], locations[1]);
        assert_eq!(fs::read_dir(storage.path()).unwrap().count(), 2);
    }

    #[test]
    fn missing_staged_file_fails_without_leftovers() {
        let storage = TempDir::new().unwrap();
        let store = DirectoryStore::new(storage.path());

        let result = store.persist(&storage.path().join("gone"), "gamma");
        assert!(matches!(result, Err(Error::Io(_))));
        assert_eq!(fs::read_dir(storage.path()).unwrap().count(), 0);
    }
}
