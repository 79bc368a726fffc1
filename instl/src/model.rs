// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The install-item (IID) data model: per-OS bags, inheritance, and the
//! action phases hung off each bag. Newtype identifiers follow the
//! `package::{Id,Name}` pattern of wrapping a `String` with a
//! `Display`/`AsRef<str>` impl rather than using bare `String`s.

use std::collections::HashMap;
use std::fmt;

/// Install Item Identifier: a globally unique opaque string key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Iid(String);

impl From<String> for Iid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Iid {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for Iid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Iid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A 36-character UUID acting as an alias for one or more [`Iid`]s.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Guid(String);

impl From<String> for Guid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for Guid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A value that names either an [`Iid`] directly or a [`Guid`] alias for
/// one or more IIDs. Used in `depends` lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Iid(Iid),
    Guid(Guid),
}

impl Reference {
    /// Classify a raw string as a guid reference if it has the shape of
    /// a 36-character UUID, otherwise as a direct iid reference.
    pub fn classify(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if looks_like_uuid(&raw) {
            Reference::Guid(Guid::from(raw))
        } else {
            Reference::Iid(Iid::from(raw))
        }
    }
}

fn looks_like_uuid(s: &str) -> bool {
    if s.len() != 36 {
        return false;
    }
    s.bytes().enumerate().all(|(i, b)| match i {
        8 | 13 | 18 | 23 => b == b'-',
        _ => b.is_ascii_hexdigit(),
    })
}

/// Per-OS variant tag. `Common` is always active; the others are active
/// only per the `active_os` selector in the index store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OsTag {
    Common,
    Mac,
    Mac32,
    Mac64,
    Win,
    Win32,
    Win64,
}

impl OsTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsTag::Common => "common",
            OsTag::Mac => "Mac",
            OsTag::Mac32 => "Mac32",
            OsTag::Mac64 => "Mac64",
            OsTag::Win => "Win",
            OsTag::Win32 => "Win32",
            OsTag::Win64 => "Win64",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "common" => OsTag::Common,
            "Mac" => OsTag::Mac,
            "Mac32" => OsTag::Mac32,
            "Mac64" => OsTag::Mac64,
            "Win" => OsTag::Win,
            "Win32" => OsTag::Win32,
            "Win64" => OsTag::Win64,
            _ => return None,
        })
    }

    /// `common` sorts lowest so it is always overridden by a more
    /// specific active OS bag at the same `position`.
    pub fn priority(&self) -> u8 {
        match self {
            OsTag::Common => 0,
            _ => 1,
        }
    }
}

/// One of the four source-path composition rules (`source kind` in the
/// glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    File,
    Files,
    Dir,
    DirCont,
}

impl SourceKind {
    pub fn parse(tag: &str) -> Option<Self> {
        Some(match tag {
            "!file" => SourceKind::File,
            "!files" => SourceKind::Files,
            "!dir" => SourceKind::Dir,
            "!dir_cont" => SourceKind::DirCont,
            _ => return None,
        })
    }
}

/// A single `install_sources` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub path: String,
    pub kind: SourceKind,
}

/// Action hook phase. Ordering here is purely nominal; the total order
/// of emitted commands is defined by the action scheduler, not by the
/// order phases are declared in this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionPhase {
    PreCopy,
    PreCopyToFolder,
    PreCopyItem,
    PostCopyItem,
    PostCopyToFolder,
    PostCopy,
    PreRemove,
    PreRemoveFromFolder,
    PreRemoveItem,
    RemoveItem,
    PostRemoveItem,
    PostRemoveFromFolder,
    PostRemove,
    PreDoit,
    Doit,
    PostDoit,
}

impl ActionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionPhase::PreCopy => "pre_copy",
            ActionPhase::PreCopyToFolder => "pre_copy_to_folder",
            ActionPhase::PreCopyItem => "pre_copy_item",
            ActionPhase::PostCopyItem => "post_copy_item",
            ActionPhase::PostCopyToFolder => "post_copy_to_folder",
            ActionPhase::PostCopy => "post_copy",
            ActionPhase::PreRemove => "pre_remove",
            ActionPhase::PreRemoveFromFolder => "pre_remove_from_folder",
            ActionPhase::PreRemoveItem => "pre_remove_item",
            ActionPhase::RemoveItem => "remove_item",
            ActionPhase::PostRemoveItem => "post_remove_item",
            ActionPhase::PostRemoveFromFolder => "post_remove_from_folder",
            ActionPhase::PostRemove => "post_remove",
            ActionPhase::PreDoit => "pre_doit",
            ActionPhase::Doit => "doit",
            ActionPhase::PostDoit => "post_doit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pre_copy" => ActionPhase::PreCopy,
            "pre_copy_to_folder" => ActionPhase::PreCopyToFolder,
            "pre_copy_item" => ActionPhase::PreCopyItem,
            "post_copy_item" => ActionPhase::PostCopyItem,
            "post_copy_to_folder" => ActionPhase::PostCopyToFolder,
            "post_copy" => ActionPhase::PostCopy,
            "pre_remove" => ActionPhase::PreRemove,
            "pre_remove_from_folder" => ActionPhase::PreRemoveFromFolder,
            "pre_remove_item" => ActionPhase::PreRemoveItem,
            "remove_item" => ActionPhase::RemoveItem,
            "post_remove_item" => ActionPhase::PostRemoveItem,
            "post_remove_from_folder" => ActionPhase::PostRemoveFromFolder,
            "post_remove" => ActionPhase::PostRemove,
            "pre_doit" => ActionPhase::PreDoit,
            "doit" => ActionPhase::Doit,
            "post_doit" => ActionPhase::PostDoit,
            _ => return None,
        })
    }
}

/// The per-OS bag of attributes: everything that inheritance folds and
/// the active-OS filter selects over.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bag {
    pub install_sources: Vec<Source>,
    pub install_folders: Vec<String>,
    pub depends: Vec<Reference>,
    pub actions: HashMap<ActionPhase, Vec<String>>,
}

impl Bag {
    /// Append `other`'s entries after this bag's own, preserving
    /// first-insertion order (invariant (d) of the data model: "this
    /// item's own entries first, then the ancestor's").
    fn extend_from(&mut self, other: &Bag) {
        self.install_sources.extend(other.install_sources.iter().cloned());
        self.install_folders.extend(other.install_folders.iter().cloned());
        self.depends.extend(other.depends.iter().cloned());
        for (phase, commands) in &other.actions {
            self.actions
                .entry(*phase)
                .or_default()
                .extend(commands.iter().cloned());
        }
    }
}

/// An install item as loaded from the index store, before inheritance
/// has been folded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallItem {
    pub iid: Iid,
    pub name: String,
    pub remark: String,
    pub description: String,
    pub guids: Vec<Guid>,
    pub inherit_from: Vec<Iid>,
    pub version: Option<String>,
    pub per_os: HashMap<OsTag, Bag>,
}

impl InstallItem {
    /// Fold this item's own per-OS bags with those of its ancestors
    /// (most-derived first), recursively, using `lookup` to find parent
    /// items. `active_oses` selects which non-`common` bags participate.
    ///
    /// This is the "inheritance resolved lazily and memoized" operation
    /// from the data model's lifecycle note; callers are expected to
    /// cache the result keyed by `(iid, active_oses)`.
    pub fn effective(
        &self,
        active_oses: &[OsTag],
        lookup: &dyn Fn(&Iid) -> Option<InstallItem>,
    ) -> Result<Bag, InheritanceError> {
        let mut visiting = std::collections::HashSet::new();
        self.effective_inner(active_oses, lookup, &mut visiting)
    }

    fn effective_inner(
        &self,
        active_oses: &[OsTag],
        lookup: &dyn Fn(&Iid) -> Option<InstallItem>,
        visiting: &mut std::collections::HashSet<Iid>,
    ) -> Result<Bag, InheritanceError> {
        if !visiting.insert(self.iid.clone()) {
            return Err(InheritanceError::Cycle(self.iid.clone()));
        }

        let mut merged = Bag::default();
        merged.extend_from(&self.selected_bag(active_oses));

        for parent_iid in &self.inherit_from {
            let parent = lookup(parent_iid)
                .ok_or_else(|| InheritanceError::UnknownParent(self.iid.clone(), parent_iid.clone()))?;
            let parent_bag = parent.effective_inner(active_oses, lookup, visiting)?;
            merged.extend_from(&parent_bag);
        }

        visiting.remove(&self.iid);
        Ok(merged)
    }

    /// Union `common`'s entries with those of each active, non-common OS
    /// bag, in `common`-then-active-OS order (own bags only, before
    /// folding in ancestors). `common` is always active.
    fn selected_bag(&self, active_oses: &[OsTag]) -> Bag {
        let mut bag = Bag::default();
        if let Some(common) = self.per_os.get(&OsTag::Common) {
            bag.extend_from(common);
        }
        for os in active_oses {
            if *os == OsTag::Common {
                continue;
            }
            if let Some(variant) = self.per_os.get(os) {
                bag.extend_from(variant);
            }
        }
        bag
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InheritanceError {
    #[error("circular inheritance at {0}")]
    Cycle(Iid),
    #[error("{0} inherits from unknown iid {1}")]
    UnknownParent(Iid, Iid),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn item(iid: &str, inherit_from: &[&str], folders: &[&str]) -> InstallItem {
        let mut per_os = HashMap::new();
        per_os.insert(
            OsTag::Common,
            Bag {
                install_folders: folders.iter().map(|s| s.to_string()).collect(),
                ..Bag::default()
            },
        );
        InstallItem {
            iid: Iid::from(iid),
            name: iid.to_string(),
            remark: String::new(),
            description: String::new(),
            guids: vec![],
            inherit_from: inherit_from.iter().map(|s| Iid::from(*s)).collect(),
            version: None,
            per_os,
        }
    }

    #[test]
    fn inheritance_is_monotonic_and_self_first() {
        let mut items: Map<Iid, InstallItem> = Map::new();
        items.insert(Iid::from("Y"), item("Y", &[], &["/y"]));
        items.insert(Iid::from("X"), item("X", &["Y"], &["/x"]));

        let lookup = |iid: &Iid| items.get(iid).cloned();
        let x = items.get(&Iid::from("X")).unwrap();
        let bag = x.effective(&[], &lookup).unwrap();

        assert_eq!(bag.install_folders, vec!["/x".to_string(), "/y".to_string()]);
    }

    #[test]
    fn inheritance_cycle_is_detected() {
        let mut items: Map<Iid, InstallItem> = Map::new();
        items.insert(Iid::from("A"), item("A", &["B"], &[]));
        items.insert(Iid::from("B"), item("B", &["A"], &[]));

        let lookup = |iid: &Iid| items.get(iid).cloned();
        let a = items.get(&Iid::from("A")).unwrap();
        assert!(matches!(
            a.effective(&[], &lookup),
            Err(InheritanceError::Cycle(_))
        ));
    }

    #[test]
    fn reference_classifies_guids_vs_iids() {
        assert!(matches!(
            Reference::classify("374b9459-c86f-4f5e-8b1e-1a160a4d6d02"),
            Reference::Guid(_)
        ));
        assert!(matches!(Reference::classify("some-iid"), Reference::Iid(_)));
    }
}
