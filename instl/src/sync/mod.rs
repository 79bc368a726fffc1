// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The sync planner: diffs the subset of `remote_map` required by the
//! resolved install set against `have_map`, producing download and
//! unwtar tasks. Grounded on `repository::manager`'s hash-sharded cache
//! layout and on `client::cache_packages`'s download-then-verify shape,
//! adapted here to the repository tree rather than stone archives.

use std::fs;
use std::path::Path;

use regex::Regex;
use thiserror::Error;

use crate::filemap::{Filter, Kind, RequireMode, Tree};
use crate::model::{Iid, Source, SourceKind};

/// One file that must be fetched from the remote repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub path: String,
    pub url: String,
    pub expected_checksum: Option<String>,
}

/// A post-download archive-reassembly step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwtarTask {
    pub archive_path: String,
    pub target_path: String,
    /// True for `.wtar.aa` (first split part): reassembly must wait on
    /// every sibling part before concatenating.
    pub is_split: bool,
}

/// The planner's output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub downloads: Vec<DownloadTask>,
    pub unwtars: Vec<UnwtarTask>,
}

/// Plan a sync: `remote_map` is mutated (its `required` flags are
/// recomputed), `have_map` is consulted but not mutated here — callers
/// apply [`Plan`] then call [`update_have_map`] themselves once the
/// downloads have actually landed.
pub fn plan(
    remote_map: &mut Tree,
    have_map: &Tree,
    install_set: &[Iid],
    sources_of: &dyn Fn(&Iid) -> Vec<Source>,
    base_url: &str,
) -> Result<Plan, Error> {
    remote_map.clear_required();

    for iid in install_set {
        for source in sources_of(iid) {
            require_source(remote_map, &source)?;
        }
    }

    let work_map = remote_map.clone_required_subtree();

    let mut downloads = Vec::new();
    let mut unwtars = Vec::new();
    let wtar_part = wtar_part_regex();

    for (path, node) in work_map.walk(Filter::File) {
        let have = have_map.get_item_at_path(&path);
        let need_download = match have {
            None => true,
            Some(have_node) => have_node.checksum != node.checksum,
        };

        if need_download {
            downloads.push(DownloadTask {
                path: path.clone(),
                url: format!("{base_url}/{}/{path}", node.revision),
                expected_checksum: node.checksum.clone(),
            });
        }

        if let Some(stripped) = path.strip_suffix(".wtar") {
            if work_map.get_item_at_path(stripped).is_none() {
                unwtars.push(UnwtarTask {
                    archive_path: path.clone(),
                    target_path: stripped.to_string(),
                    is_split: false,
                });
            }
        } else if wtar_part.is_match(&path) && path.ends_with(".wtar.aa") {
            let stripped = path.trim_end_matches(".aa");
            unwtars.push(UnwtarTask {
                archive_path: path.clone(),
                target_path: stripped.trim_end_matches(".wtar").to_string(),
                is_split: true,
            });
        }
    }

    Ok(Plan { downloads, unwtars })
}

fn require_source(remote_map: &mut Tree, source: &Source) -> Result<(), Error> {
    if let Some(node) = remote_map.get_item_at_path(&source.path) {
        match source.kind {
            SourceKind::File => {
                if !matches!(node.kind, Kind::File) {
                    return Err(Error::SourceKindMismatch(source.path.clone()));
                }
                remote_map.set_required(&source.path, RequireMode::Single)?;
            }
            SourceKind::Dir | SourceKind::DirCont => {
                remote_map.set_required(&source.path, RequireMode::All)?;
            }
            SourceKind::Files => {
                remote_map.set_required(&source.path, RequireMode::FilesOnly)?;
            }
        }
        return Ok(());
    }

    // Not found directly: look for split wtar parts in the parent dir.
    let (parent, leaf) = split_parent_leaf(&source.path);
    let pattern = Regex::new(&format!("^{}\\.wtar(\\.[a-z][a-z])?$", regex::escape(leaf)))
        .expect("constructed regex is always valid");

    let parent_node = parent.and_then(|p| remote_map.get_item_at_path(p));
    let matches: Vec<String> = match parent_node {
        Some(dir) => dir
            .children()
            .filter(|c| pattern.is_match(&c.name))
            .map(|c| match parent {
                Some(p) => format!("{p}/{}", c.name),
                None => c.name.clone(),
            })
            .collect(),
        None => Vec::new(),
    };

    if matches.is_empty() {
        return Err(Error::SourcePathMissing(source.path.clone()));
    }

    for path in matches {
        remote_map.set_required(&path, RequireMode::Single)?;
    }
    Ok(())
}

fn split_parent_leaf(path: &str) -> (Option<&str>, &str) {
    match path.rsplit_once('/') {
        Some((parent, leaf)) => (Some(parent), leaf),
        None => (None, path),
    }
}

fn wtar_part_regex() -> Regex {
    Regex::new(r"\.wtar\.[a-z][a-z]$").expect("constructed regex is always valid")
}

/// Refresh `have_map` entries from `remote_map`'s required subtree and
/// write the result atomically: write to a sibling temp path, fsync,
/// rename over the old file, matching the teacher's own atomic state
/// writes.
pub fn update_have_map(path: &Path, remote_map: &Tree, comments: &[String]) -> Result<(), Error> {
    let work_map = remote_map.clone_required_subtree();

    let tmp_path = path.with_extension("tmp");
    {
        let file = fs::File::create(&tmp_path)?;
        let mut writer = std::io::BufWriter::new(&file);
        crate::filemap::write_text(&mut writer, comments, &work_map)?;
        use std::io::Write;
        writer.flush()?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("source path missing: {0}")]
    SourcePathMissing(String),
    #[error("source kind mismatch: {0}")]
    SourceKindMismatch(String),
    #[error("filemap")]
    FileMap(#[from] crate::filemap::Error),
    #[error("io")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filemap::{Kind as NodeKind, Node};

    fn file(name: &str, revision: u64, checksum: &str) -> Node {
        let mut n = Node::new(name, NodeKind::File);
        n.revision = revision;
        n.checksum = Some(checksum.to_string());
        n
    }

    #[test]
    fn sync_skip_s4_emits_no_download_when_checksums_match() {
        let mut remote = Tree::new();
        remote.new_item_at_path("foo", file("foo", 7, "abc"), true).unwrap();
        let mut have = Tree::new();
        have.new_item_at_path("foo", file("foo", 7, "abc"), true).unwrap();

        let sources = |_: &Iid| {
            vec![Source {
                path: "foo".to_string(),
                kind: SourceKind::File,
            }]
        };

        let plan = plan(&mut remote, &have, &[Iid::from("A")], &sources, "https://repo").unwrap();
        assert!(plan.downloads.is_empty());
        assert!(plan.unwtars.is_empty());
    }

    #[test]
    fn sync_wtar_rebuild_s5_emits_unwtar_without_download() {
        let mut remote = Tree::new();
        remote
            .new_item_at_path("bar.wtar", file("bar.wtar", 3, "def"), true)
            .unwrap();
        let mut have = Tree::new();
        have.new_item_at_path("bar.wtar", file("bar.wtar", 3, "def"), true)
            .unwrap();

        let sources = |_: &Iid| {
            vec![Source {
                path: "bar.wtar".to_string(),
                kind: SourceKind::File,
            }]
        };

        let plan = plan(&mut remote, &have, &[Iid::from("A")], &sources, "https://repo").unwrap();
        assert!(plan.downloads.is_empty());
        assert_eq!(plan.unwtars.len(), 1);
        assert_eq!(plan.unwtars[0].target_path, "bar");
    }

    #[test]
    fn missing_source_path_is_an_error() {
        let mut remote = Tree::new();
        let have = Tree::new();
        let sources = |_: &Iid| {
            vec![Source {
                path: "ghost".to_string(),
                kind: SourceKind::File,
            }]
        };

        let err = plan(&mut remote, &have, &[Iid::from("A")], &sources, "https://repo").unwrap_err();
        assert!(matches!(err, Error::SourcePathMissing(p) if p == "ghost"));
    }

    #[test]
    fn dir_kind_requires_whole_subtree() {
        let mut remote = Tree::new();
        remote.new_item_at_path("d/a", file("a", 1, "x"), true).unwrap();
        remote.new_item_at_path("d/b", file("b", 1, "y"), true).unwrap();
        let have = Tree::new();

        let sources = |_: &Iid| {
            vec![Source {
                path: "d".to_string(),
                kind: SourceKind::Dir,
            }]
        };

        let plan = plan(&mut remote, &have, &[Iid::from("A")], &sources, "https://repo").unwrap();
        assert_eq!(plan.downloads.len(), 2);
    }

    #[test]
    fn download_url_uses_the_file_s_own_revision_not_a_global_one() {
        let mut remote = Tree::new();
        remote.new_item_at_path("d/a", file("a", 4, "x"), true).unwrap();
        remote.new_item_at_path("d/b", file("b", 9, "y"), true).unwrap();
        let have = Tree::new();

        let sources = |_: &Iid| {
            vec![Source {
                path: "d".to_string(),
                kind: SourceKind::Dir,
            }]
        };

        let plan = plan(&mut remote, &have, &[Iid::from("A")], &sources, "https://repo").unwrap();
        let urls: Vec<&str> = plan.downloads.iter().map(|d| d.url.as_str()).collect();
        assert!(urls.contains(&"https://repo/4/d/a"));
        assert!(urls.contains(&"https://repo/9/d/b"));
    }
}
