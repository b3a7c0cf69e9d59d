//! Chunk store. Owns the temporary workspace directory and the chunk files inside it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log;
use tempfile;

const CHUNK_PREFIX: &str = "chunk";

/// Handle of a chunk file stored in a [`Workspace`].
#[derive(Debug, PartialEq, Eq)]
pub struct ChunkHandle {
    path: PathBuf,
}

impl ChunkHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Temporary workspace holding the chunk files of a single sort run.
///
/// The directory and everything inside it is removed by [`Workspace::destroy`] or,
/// if it was not called, when the workspace is dropped.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    destroyed: bool,
}

impl Workspace {
    /// Opens the workspace at `path` creating the directory if it does not exist.
    /// If `path` is [`None`] a new uniquely named directory is created in the OS temporary directory.
    pub fn create(path: Option<&Path>) -> io::Result<Self> {
        let path = match path {
            Some(path) => {
                fs::create_dir_all(path)?;
                path.to_path_buf()
            }
            None => tempfile::Builder::new().prefix("kv-ext-sort").tempdir()?.into_path(),
        };

        log::info!("using {} as a workspace directory", path.display());

        return Ok(Workspace {
            path,
            destroyed: false,
        });
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocates a new uniquely named chunk file and opens it for writing.
    pub fn new_chunk(&self, suffix: &str) -> io::Result<(ChunkHandle, fs::File)> {
        let (file, path) = tempfile::Builder::new()
            .prefix(CHUNK_PREFIX)
            .suffix(suffix)
            .tempfile_in(&self.path)?
            .keep()
            .map_err(|err| err.error)?;

        log::trace!("chunk file {} allocated", path.display());

        return Ok((ChunkHandle { path }, file));
    }

    /// Opens a chunk file for sequential reading.
    pub fn open(&self, handle: &ChunkHandle) -> io::Result<fs::File> {
        fs::File::open(&handle.path)
    }

    /// Deletes a single chunk file.
    pub fn delete(&self, handle: ChunkHandle) -> io::Result<()> {
        fs::remove_file(&handle.path)
    }

    /// Lists chunk files currently present in the workspace.
    pub fn list(&self) -> io::Result<Vec<PathBuf>> {
        let mut chunks = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_file() && entry.file_name().to_string_lossy().starts_with(CHUNK_PREFIX) {
                chunks.push(entry.path());
            }
        }
        chunks.sort();

        return Ok(chunks);
    }

    /// Removes the workspace directory with all its content.
    /// Removal is best-effort: failures are logged and the number of entries that
    /// could not be removed is returned.
    pub fn destroy(&mut self) -> usize {
        if self.destroyed {
            return 0;
        }
        self.destroyed = true;

        let failures = remove_tree(&self.path);
        if failures == 0 {
            log::debug!("workspace {} removed", self.path.display());
        } else {
            log::error!("workspace {} not fully removed ({} entries left)", self.path.display(), failures);
        }

        return failures;
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Depth-first removal driven by an explicit stack. A directory is pushed twice:
/// first to expand its entries, then to remove it once they are gone.
fn remove_tree(root: &Path) -> usize {
    let mut failures = 0;
    let mut stack = vec![(root.to_path_buf(), false)];

    while let Some((path, expanded)) = stack.pop() {
        if expanded {
            if let Err(err) = fs::remove_dir(&path) {
                log::error!("directory {} not removed: {}", path.display(), err);
                failures += 1;
            }
            continue;
        }

        let metadata = match fs::symlink_metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => {
                log::error!("file {} not inspected: {}", path.display(), err);
                failures += 1;
                continue;
            }
        };

        if !metadata.is_dir() {
            if let Err(err) = fs::remove_file(&path) {
                log::error!("file {} not removed: {}", path.display(), err);
                failures += 1;
            }
            continue;
        }

        stack.push((path.clone(), true));
        match fs::read_dir(&path) {
            Ok(entries) => {
                for entry in entries {
                    match entry {
                        Ok(entry) => stack.push((entry.path(), false)),
                        Err(err) => {
                            log::error!("directory {} not listed: {}", path.display(), err);
                            failures += 1;
                        }
                    }
                }
            }
            Err(err) => {
                log::error!("directory {} not listed: {}", path.display(), err);
                failures += 1;
            }
        }
    }

    return failures;
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io::prelude::*;

    use rstest::*;

    use super::Workspace;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[rstest]
    fn test_create_nested_and_existing(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("a").join("b");

        let mut workspace = Workspace::create(Some(&path)).unwrap();
        assert!(path.is_dir());

        let mut again = Workspace::create(Some(&path)).unwrap();
        assert_eq!(again.path(), workspace.path());

        assert_eq!(again.destroy(), 0);
        assert!(!path.exists());
        assert_eq!(workspace.destroy(), 0);
    }

    #[rstest]
    fn test_chunk_lifecycle(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("ws");
        let mut workspace = Workspace::create(Some(&path)).unwrap();

        let (first, mut file) = workspace.new_chunk(".txt").unwrap();
        file.write_all(b"1|a\n").unwrap();
        drop(file);
        let (second, _) = workspace.new_chunk(".txt").unwrap();
        assert_ne!(first.path(), second.path());
        assert_eq!(workspace.list().unwrap().len(), 2);

        let mut content = String::new();
        workspace.open(&first).unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "1|a\n");

        workspace.delete(second).unwrap();
        assert_eq!(workspace.list().unwrap(), vec![first.path().to_path_buf()]);

        workspace.destroy();
        assert!(!path.exists());
    }

    #[rstest]
    fn test_destroy_removes_nested_tree(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("ws");
        let mut workspace = Workspace::create(Some(&path)).unwrap();

        let nested = path.join("x").join("y").join("z");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("leftover"), b"data").unwrap();
        fs::write(path.join("x").join("other"), b"data").unwrap();

        assert_eq!(workspace.destroy(), 0);
        assert!(!path.exists());
        assert_eq!(workspace.destroy(), 0);
    }

    #[test]
    fn test_default_location_removed_on_drop() {
        let workspace = Workspace::create(None).unwrap();
        let path = workspace.path().to_path_buf();
        assert!(path.is_dir());

        drop(workspace);
        assert!(!path.exists());
    }
}
