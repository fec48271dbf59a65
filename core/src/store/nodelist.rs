// Node list file: the on-disk peer cache
//
// Plain text, one `host:port` per line, no header. Every save replaces the
// whole file through a rename so readers never observe a half-written list.
// Each save stages into its own temp file, so concurrent writers never share
// one; whichever rename lands last wins.

use crate::peer::{PeerAddress, PeerList};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

/// Default file name used when no explicit path is configured
pub const NODELIST_FILE: &str = "nodelist.txt";

#[derive(Debug, Error)]
pub enum PeerListError {
    #[error("Node list not found: {0}")]
    NotFound(PathBuf),
    #[error("Node list I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Persists and loads a flat list of peer addresses
#[derive(Debug, Clone)]
pub struct PeerListStore {
    path: PathBuf,
}

impl PeerListStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the node list with `peers`, in order.
    pub fn save(&self, peers: &[PeerAddress]) -> Result<(), PeerListError> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let mut contents = String::with_capacity(peers.len() * 22);
        for peer in peers {
            contents.push_str(&peer.to_string());
            contents.push('\n');
        }

        let mut staged = NamedTempFile::new_in(parent)?;
        staged.write_all(contents.as_bytes())?;
        staged.as_file().sync_all()?;
        staged.persist(&self.path).map_err(|e| e.error)?;

        debug!("Saved {} peers to {}", peers.len(), self.path.display());
        Ok(())
    }

    /// Load the node list. Lines without a `:` or with an unparsable port are
    /// skipped.
    pub fn load(&self) -> Result<PeerList, PeerListError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(PeerListError::NotFound(self.path.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && line.contains(':'))
            .filter_map(|line| line.parse().ok())
            .collect())
    }
}

// ============================================================================
// TESTS
// ============================================================================
