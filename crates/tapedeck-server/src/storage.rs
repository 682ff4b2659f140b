//! Recording storage layout
//!
//! Every ingest session owns `<root>/<session-id>/` holding `output.ivf` and
//! `output.opus`. Playback without a selected recording falls back to the same
//! two file names directly under the root.

use std::io;
use std::path::{Path, PathBuf};
use tapedeck_protocol::is_uuid_like;
use tokio::fs;
use uuid::Uuid;

pub const VIDEO_FILE: &str = "output.ivf";
pub const AUDIO_FILE: &str = "output.opus";

#[derive(Clone, Debug)]
pub struct RecordingStore {
    root: PathBuf,
}

impl RecordingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, id: Uuid) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Create the directory for a new ingest session, parents included
    pub async fn create_session_dir(&self, id: Uuid) -> io::Result<PathBuf> {
        let dir = self.session_dir(id);
        fs::create_dir_all(&dir).await?;
        tracing::debug!("Created recording directory {}", dir.display());
        Ok(dir)
    }

    /// Directory holding the files to replay, or `None` for an unknown recording
    pub async fn playback_dir(&self, recording: Option<Uuid>) -> Option<PathBuf> {
        match recording {
            Some(id) => {
                let dir = self.session_dir(id);
                let is_dir = fs::metadata(&dir).await.is_ok_and(|m| m.is_dir());
                is_dir.then_some(dir)
            }
            None => Some(self.root.clone()),
        }
    }

    /// Names of UUID-shaped directories under the root.
    ///
    /// A missing root lists as empty. Order follows the filesystem.
    pub async fn list_recordings(&self) -> io::Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e),
        };

        let mut names = vec![];
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if is_uuid_like(name) {
                    names.push(name.to_string());
                }
            }
        }

        Ok(names)
    }
}

pub fn video_path(dir: &Path) -> PathBuf {
    dir.join(VIDEO_FILE)
}

pub fn audio_path(dir: &Path) -> PathBuf {
    dir.join(AUDIO_FILE)
}
