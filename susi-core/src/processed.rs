//! Persisted set of image ids that were already posted.
//!
//! Membership means "never post this again", across restarts. The set only
//! grows. Each insert is written through to disk before the orchestrator
//! reports success, so a crash right after a post cannot cause a repost on the
//! next start.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::PipelineError;

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProcessedFile {
    processed: BTreeSet<String>,
}

/// Ids already handled, optionally backed by a JSON file.
#[derive(Debug, Default)]
pub struct ProcessedSet {
    path: Option<PathBuf>,
    ids: BTreeSet<String>,
}

impl ProcessedSet {
    /// An in-memory set that is never persisted.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the set from `path`. A missing file is an empty set.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let path = path.into();
        let ids = match std::fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => BTreeSet::new(),
            Ok(contents) => serde_json::from_str::<ProcessedFile>(&contents)?.processed,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No processed-set file yet, starting empty");
                BTreeSet::new()
            }
            Err(e) => return Err(e.into()),
        };
        info!(path = %path.display(), count = ids.len(), "Loaded processed set");
        Ok(Self {
            path: Some(path),
            ids,
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    /// Record `id` and persist. Returns whether the id was new.
    ///
    /// If saving fails the id stays in memory, so this process still never
    /// posts it again; the error tells the caller the file is stale.
    pub fn insert(&mut self, id: &str) -> Result<bool, PipelineError> {
        if !self.ids.insert(id.to_string()) {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    /// Write the set atomically: temp file in the same directory, then rename.
    pub fn save(&self) -> Result<(), PipelineError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let dir = parent_dir(path);
        std::fs::create_dir_all(dir)?;

        let file = ProcessedFile {
            processed: self.ids.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| PipelineError::Io(e.error))?;
        debug!(path = %path.display(), count = self.ids.len(), "Saved processed set");
        Ok(())
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}
