// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Resolves the on-disk locations this engine reads and writes:
//! the index database, the download staging area, and the `have`
//! file-map. Grounded on the teacher's `Installation` (root-relative
//! path builders, mutability probed via `nix::unistd::access`), adapted
//! from a system-rootfs model to a per-user cache tree via `dirs`.

use std::fmt;
use std::path::{Path, PathBuf};

use log::trace;
use nix::unistd::{access, AccessFlags, Uid};

/// Do we have write access to this installation's root?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutability {
    ReadOnly,
    ReadWrite,
}

impl fmt::Display for Mutability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutability::ReadOnly => "read-only".fmt(f),
            Mutability::ReadWrite => "read-write".fmt(f),
        }
    }
}

/// The working tree this engine operates under: where the index
/// database lives, where downloads stage before being placed, and the
/// root mutability probed per the current user's access.
#[derive(Debug, Clone)]
pub struct Installation {
    pub root: PathBuf,
    pub mutability: Mutability,
}

impl Installation {
    /// Open `root` (creating it if missing), probing mutability per the
    /// current user's access rights, same as the teacher's own
    /// root-or-writable-by-uid check.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        ensure_dirs_exist(&root);

        let mutability = if Uid::effective().is_root() || access(&root, AccessFlags::W_OK).is_ok() {
            Mutability::ReadWrite
        } else {
            Mutability::ReadOnly
        };
        trace!("installation root {root:?} is {mutability}");

        Self { root, mutability }
    }

    /// Resolve the default root: `$XDG_CACHE_HOME/instl` (via the
    /// `dirs` crate), falling back to `.instl` under the current
    /// directory when no cache dir can be determined.
    pub fn default_root() -> PathBuf {
        dirs::cache_dir()
            .map(|dir| dir.join("instl"))
            .unwrap_or_else(|| PathBuf::from(".instl"))
    }

    pub fn read_only(&self) -> bool {
        matches!(self.mutability, Mutability::ReadOnly)
    }

    fn sub(&self, path: impl AsRef<Path>) -> PathBuf {
        self.root.join(path)
    }

    pub fn db_path(&self) -> PathBuf {
        self.sub("index.db")
    }

    pub fn staging_path(&self) -> PathBuf {
        self.sub("staging")
    }

    pub fn have_map_path(&self) -> PathBuf {
        self.sub("have.map")
    }
}

fn ensure_dirs_exist(root: &Path) {
    let _ = std::fs::create_dir_all(root.join("staging"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_paths_are_rooted_under_installation_root() {
        let installation = Installation {
            root: PathBuf::from("/tmp/instl-test-root"),
            mutability: Mutability::ReadWrite,
        };
        assert_eq!(installation.db_path(), PathBuf::from("/tmp/instl-test-root/index.db"));
        assert_eq!(
            installation.staging_path(),
            PathBuf::from("/tmp/instl-test-root/staging")
        );
    }
}
