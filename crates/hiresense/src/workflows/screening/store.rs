use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Long-lived artifacts (e.g. the SQLite memory store) shared between runs.
///
/// Runs work on private copies. After a run aggregates, its copies are written back here
/// one run at a time, each file replaced by an atomic rename.
#[derive(Debug)]
pub struct ArtifactStore {
    dir: PathBuf,
    writer: Mutex<()>,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            writer: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copies each named workspace file back into the store, skipping names the run did
    /// not leave behind. Returns the names actually merged.
    pub fn merge_back<'a, I>(&self, workspace: &Path, names: I) -> io::Result<Vec<String>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let _guard = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::fs::create_dir_all(&self.dir)?;

        let mut merged = Vec::new();
        for name in names {
            if Path::new(name).file_name().and_then(|n| n.to_str()) != Some(name) {
                debug!(name, "skipping artifact with a nested path");
                continue;
            }
            let source = workspace.join(name);
            if !source.is_file() {
                continue;
            }
            self.replace(&source, name)?;
            if !merged.iter().any(|existing| existing == name) {
                merged.push(name.to_string());
            }
        }

        if !merged.is_empty() {
            info!(
                store = %self.dir.display(),
                artifacts = ?merged,
                "persisted artifacts merged back"
            );
        }
        Ok(merged)
    }

    fn replace(&self, source: &Path, name: &str) -> io::Result<()> {
        let mut staged = NamedTempFile::new_in(&self.dir)?;
        io::copy(&mut File::open(source)?, staged.as_file_mut())?;
        staged.as_file_mut().sync_all()?;
        staged
            .persist(self.dir.join(name))
            .map(|_| ())
            .map_err(|err| err.error)
    }
}
