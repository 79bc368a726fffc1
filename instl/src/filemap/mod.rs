// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The in-memory repository tree: every node carries path, kind,
//! revision, checksum, size and a transient `required` flag used by the
//! sync planner. Children are stored as a sorted map rather than per-node
//! parent pointers (matching the vfs crate's avoidance of arena-parent
//! bookkeeping), and `walk` uses an explicit stack rather than recursion
//! so large trees don't blow the call stack.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

mod text;

pub use text::{read_text, write_text};

/// The kind of a repository node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    File,
    Dir,
    Symlink,
}

impl Kind {
    fn flag_char(&self) -> char {
        match self {
            Kind::File => 'f',
            Kind::Dir => 'd',
            Kind::Symlink => 's',
        }
    }
}

bitflags::bitflags! {
    /// Extra per-node flags, packed alongside `kind` in the serialized
    /// `flags` field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u8 {
        const EXECUTABLE = 0b0000_0001;
        const SPECIAL    = 0b0000_0010;
    }
}

/// A single node of the repository tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub kind: Kind,
    pub revision: u64,
    pub checksum: Option<String>,
    pub size: Option<u64>,
    pub flags: Flags,
    pub props: Vec<String>,
    pub required: bool,
    children: BTreeMap<String, Node>,
}

impl Node {
    pub fn new(name: impl Into<String>, kind: Kind) -> Self {
        Self {
            name: name.into(),
            kind,
            revision: 0,
            checksum: None,
            size: None,
            flags: Flags::empty(),
            props: Vec::new(),
            required: false,
            children: BTreeMap::new(),
        }
    }

    pub fn children(&self) -> impl Iterator<Item = &Node> {
        self.children.values()
    }

    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.get(name)
    }

    /// A dir's revision equals the max revision of its descendants.
    fn recompute_dir_revision(&mut self) {
        if matches!(self.kind, Kind::Dir) {
            self.revision = self.children.values().map(|c| c.revision).max().unwrap_or(0);
        }
    }
}

/// The kind filter accepted by [`Tree::walk`] and [`Tree::set_required`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    File,
    Dir,
    Symlink,
    Any,
}

impl Filter {
    fn matches(&self, kind: Kind) -> bool {
        match self {
            Filter::Any => true,
            Filter::File => matches!(kind, Kind::File),
            Filter::Dir => matches!(kind, Kind::Dir),
            Filter::Symlink => matches!(kind, Kind::Symlink),
        }
    }
}

/// Subtree selection mode for [`Tree::set_required`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequireMode {
    /// Only the named node.
    Single,
    /// The node's immediate file children, but not recursively.
    FilesOnly,
    /// The node and its entire subtree.
    All,
}

/// The repository tree itself, rooted at an unnamed directory node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    root: Node,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    pub fn new() -> Self {
        Self {
            root: Node::new("", Kind::Dir),
        }
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Insert a node at `path`, optionally creating intermediate
    /// directories. Fails if an existing node at `path` (or along the
    /// way) has a different kind than required.
    pub fn new_item_at_path(
        &mut self,
        path: &str,
        mut attrs: Node,
        create_folders: bool,
    ) -> Result<(), Error> {
        let components: Vec<&str> = split_path(path);
        if components.is_empty() {
            return Err(Error::PathCollision(path.to_string()));
        }

        let mut cursor = &mut self.root;
        for component in &components[..components.len() - 1] {
            let entry = cursor.children.entry(component.to_string());
            cursor = match entry {
                std::collections::btree_map::Entry::Occupied(o) => {
                    let node = o.into_mut();
                    if !matches!(node.kind, Kind::Dir) {
                        return Err(Error::PathCollision(path.to_string()));
                    }
                    node
                }
                std::collections::btree_map::Entry::Vacant(v) => {
                    if !create_folders {
                        return Err(Error::PathCollision(path.to_string()));
                    }
                    v.insert(Node::new(*component, Kind::Dir))
                }
            };
        }

        let leaf_name = components[components.len() - 1];
        attrs.name = leaf_name.to_string();

        if let Some(existing) = cursor.children.get(leaf_name) {
            if existing.kind != attrs.kind {
                return Err(Error::PathCollision(path.to_string()));
            }
        }
        cursor.children.insert(leaf_name.to_string(), attrs);

        self.propagate_revisions(&components);
        Ok(())
    }

    fn propagate_revisions(&mut self, components: &[&str]) {
        // Walk down to each ancestor from the root and recompute
        // revisions bottom-up so a dir's revision always equals the max
        // of its descendants once insertion completes.
        fn recurse(node: &mut Node, remaining: &[&str]) {
            if let Some((head, tail)) = remaining.split_first() {
                if let Some(child) = node.children.get_mut(*head) {
                    recurse(child, tail);
                }
            }
            node.recompute_dir_revision();
        }
        recurse(&mut self.root, components);
    }

    pub fn get_item_at_path(&self, path: &str) -> Option<&Node> {
        let components = split_path(path);
        let mut cursor = &self.root;
        for component in components {
            cursor = cursor.children.get(component)?;
        }
        Some(cursor)
    }

    fn get_item_at_path_mut(&mut self, path: &str) -> Option<&mut Node> {
        let components = split_path(path);
        let mut cursor = &mut self.root;
        for component in components {
            cursor = cursor.children.get_mut(component)?;
        }
        Some(cursor)
    }

    /// Deterministic pre-order traversal, children visited lexically.
    pub fn walk(&self, what: Filter) -> Vec<(String, &Node)> {
        let mut out = Vec::new();
        let mut stack: Vec<(String, &Node)> = self
            .root
            .children
            .values()
            .rev()
            .map(|c| (c.name.clone(), c))
            .collect();

        while let Some((path, node)) = stack.pop() {
            if what.matches(node.kind) {
                out.push((path.clone(), node));
            }
            for child in node.children.values().rev() {
                stack.push((format!("{path}/{}", child.name), child));
            }
        }
        out
    }

    /// Mutate the `required` flag of the subtree rooted at `path`.
    pub fn set_required(&mut self, path: &str, mode: RequireMode) -> Result<(), Error> {
        let node = self
            .get_item_at_path_mut(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;

        match mode {
            RequireMode::Single => {
                node.required = true;
            }
            RequireMode::FilesOnly => {
                node.required = true;
                for child in node.children.values_mut() {
                    if matches!(child.kind, Kind::File) {
                        child.required = true;
                    }
                }
            }
            RequireMode::All => {
                set_required_recursive(node);
            }
        }
        Ok(())
    }

    /// Clear the `required` flag throughout the whole tree (step 1 of
    /// the sync planner's procedure).
    pub fn clear_required(&mut self) {
        fn recurse(node: &mut Node) {
            node.required = false;
            for child in node.children.values_mut() {
                recurse(child);
            }
        }
        recurse(&mut self.root);
    }

    /// Depth-first purge of nodes whose `required` is false and, for
    /// dirs, whose subtree is empty after purge.
    pub fn remove_unrequired(&mut self) {
        fn recurse(node: &mut Node) {
            let keys: Vec<String> = node.children.keys().cloned().collect();
            for key in keys {
                if let Some(child) = node.children.get_mut(&key) {
                    if matches!(child.kind, Kind::Dir) {
                        recurse(child);
                        if !child.required && child.children.is_empty() {
                            node.children.remove(&key);
                        }
                    } else if !child.required {
                        node.children.remove(&key);
                    }
                }
            }
        }
        recurse(&mut self.root);
    }

    /// Produce a clone of this tree pruned to only required nodes
    /// (directories retained if they contain any required descendant).
    pub fn clone_required_subtree(&self) -> Tree {
        let mut clone = self.clone();
        clone.remove_unrequired();
        clone
    }
}

fn set_required_recursive(node: &mut Node) {
    node.required = true;
    for child in node.children.values_mut() {
        set_required_recursive(child);
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Kind::File => "file",
            Kind::Dir => "dir",
            Kind::Symlink => "symlink",
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("path collision at {0}")]
    PathCollision(String),
    #[error("no node at {0}")]
    NotFound(String),
    #[error("parse error: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, revision: u64, checksum: &str) -> Node {
        let mut n = Node::new(name, Kind::File);
        n.revision = revision;
        n.checksum = Some(checksum.to_string());
        n
    }

    #[test]
    fn insert_and_lookup_roundtrip() {
        let mut tree = Tree::new();
        tree.new_item_at_path("usr/bin/nano", file("nano", 1, "abc"), true)
            .unwrap();

        let node = tree.get_item_at_path("usr/bin/nano").unwrap();
        assert_eq!(node.checksum.as_deref(), Some("abc"));

        let dir = tree.get_item_at_path("usr/bin").unwrap();
        assert!(matches!(dir.kind, Kind::Dir));
        assert_eq!(dir.revision, 1);
    }

    #[test]
    fn kind_mismatch_is_path_collision() {
        let mut tree = Tree::new();
        tree.new_item_at_path("p/f", file("f", 1, "abc"), true).unwrap();
        let err = tree.new_item_at_path("p/f/g", file("g", 1, "abc"), true);
        assert_eq!(err, Err(Error::PathCollision("p/f/g".to_string())));
    }

    #[test]
    fn walk_is_lexicographic_preorder() {
        let mut tree = Tree::new();
        tree.new_item_at_path("b", file("b", 1, "x"), true).unwrap();
        tree.new_item_at_path("a", file("a", 1, "x"), true).unwrap();
        tree.new_item_at_path("c/d", file("d", 1, "x"), true).unwrap();

        let paths: Vec<String> = tree.walk(Filter::Any).into_iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["a", "b", "c", "c/d"]);
    }

    #[test]
    fn set_required_files_only_is_not_recursive() {
        let mut tree = Tree::new();
        tree.new_item_at_path("dir/a", file("a", 1, "x"), true).unwrap();
        tree.new_item_at_path("dir/sub/b", file("b", 1, "x"), true).unwrap();

        tree.set_required("dir", RequireMode::FilesOnly).unwrap();

        assert!(tree.get_item_at_path("dir/a").unwrap().required);
        assert!(!tree.get_item_at_path("dir/sub/b").unwrap().required);
    }

    #[test]
    fn remove_unrequired_purges_empty_dirs() {
        let mut tree = Tree::new();
        tree.new_item_at_path("keep", file("keep", 1, "x"), true).unwrap();
        tree.new_item_at_path("drop/nested", file("nested", 1, "x"), true)
            .unwrap();

        tree.set_required("keep", RequireMode::Single).unwrap();
        tree.remove_unrequired();

        assert!(tree.get_item_at_path("keep").is_some());
        assert!(tree.get_item_at_path("drop").is_none());
    }
}
