//! Per-invocation scratch directories
//!
//! The only place a worker may touch. Created by the kernel, lent to one
//! worker, and deleted when dropped, whichever way the invocation ended.

use std::fmt;
use std::path::Path;

use modbox_pool::Credentials;
use modbox_table::{write_table, Table, TableError};
use modbox_wire::{resolve_in, WireError};
use nix::unistd::{chown, Gid, Uid};
use tempfile::TempDir;
use tracing::warn;

/// Why a table could not be placed in a scratch directory
#[derive(Debug, thiserror::Error)]
pub enum ScratchError {
    /// The name is not a safe scratch filename
    #[error(transparent)]
    Name(#[from] WireError),
    /// Writing failed
    #[error(transparent)]
    Table(#[from] TableError),
    /// Ownership change failed
    #[error("chown: {0}")]
    Chown(#[from] nix::Error),
}

/// A private, self-deleting directory
pub struct ScratchDir {
    dir: TempDir,
    owner: Option<Credentials>,
}

impl fmt::Debug for ScratchDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchDir")
            .field("path", &self.dir.path())
            .field("owner", &self.owner)
            .finish()
    }
}

impl ScratchDir {
    /// Create a directory under `root`, owned by `owner` when given
    ///
    /// # Errors
    ///
    /// Fails when the directory cannot be created or handed over.
    pub fn new_in(root: &Path, owner: Option<Credentials>) -> std::io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("modbox-").tempdir_in(root)?;
        let scratch = Self { dir, owner };
        scratch.hand_over(scratch.path()).map_err(std::io::Error::from)?;
        Ok(scratch)
    }

    /// Directory path
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `table` as `name` inside the directory
    ///
    /// # Errors
    ///
    /// Fails for an unsafe name or a write failure.
    pub fn write_table(&self, name: &str, table: &Table) -> Result<(), ScratchError> {
        let path = resolve_in(self.path(), name)?;
        write_table(&path, table)?;
        self.hand_over(&path)?;
        Ok(())
    }

    fn hand_over(&self, path: &Path) -> Result<(), nix::Error> {
        match self.owner {
            Some(Credentials { uid, gid }) => chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))),
            None => Ok(()),
        }
    }

    /// Delete the directory now, reporting failure
    ///
    /// # Errors
    ///
    /// Fails when something inside cannot be removed.
    pub fn close(self) -> std::io::Result<()> {
        let path = self.path().to_path_buf();
        self.dir.close().map_err(|e| {
            warn!(path = %path.display(), error = %e, "scratch directory cleanup failed");
            e
        })
    }
}
