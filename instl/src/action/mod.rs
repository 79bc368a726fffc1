// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The action scheduler: orders and deduplicates the `pre_copy`/
//! `post_copy` hook family across the resolved install set, composing
//! a flat [`batch::Command`] sequence. Grounded on `crates/triggers`'
//! `Manager`/`ExtractedHandler` dedup-by-identity pattern, adapted from
//! glob-matched handlers to the phase-ordered nested loop of the
//! component design.

use std::collections::HashSet;

use crate::batch::Command;
use crate::model::{ActionPhase, Iid, Source, SourceKind};

/// One resolved item's contribution to the scheduling pass: its
/// resolved folders, per-folder sources, and per-phase action command
/// strings (already variable-expanded).
pub struct Item {
    pub iid: Iid,
    pub folders: Vec<String>,
    pub sources: Vec<Source>,
    pub actions: Vec<(ActionPhase, String)>,
}

impl Item {
    fn actions_for(&self, phase: ActionPhase) -> impl Iterator<Item = &str> {
        self.actions.iter().filter(move |(p, _)| *p == phase).map(|(_, cmd)| cmd.as_str())
    }
}

/// Scope a deduplication key is computed against, per the "Action
/// dedup" testable property: empty for `pre_copy`/`post_copy`, the
/// folder for `*_to_folder`, the `(iid, source)` pair for `*_item`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Scope {
    None,
    Folder(String),
    Item(Iid, String),
}

/// Emit the copy-phase command sequence for `items`, in the §4.7 nested
/// order, with each `(phase, scope, command)` triple appearing at most
/// once.
pub fn schedule_copy(items: &[Item]) -> Vec<Command> {
    let mut seen: HashSet<(ActionPhase, Scope, String)> = HashSet::new();
    let mut out = Vec::new();

    emit_global(&mut out, &mut seen, items, ActionPhase::PreCopy);

    let folders = folder_union(items);
    for folder in &folders {
        emit_scoped(&mut out, &mut seen, items, ActionPhase::PreCopyToFolder, folder);

        for item in items.iter().filter(|i| i.folders.contains(folder)) {
            for source in &item.sources {
                emit_item_scoped(&mut out, &mut seen, item, ActionPhase::PreCopyItem, source);
                out.push(copy_command_for(source, folder));
                emit_item_scoped(&mut out, &mut seen, item, ActionPhase::PostCopyItem, source);
            }
        }

        emit_scoped(&mut out, &mut seen, items, ActionPhase::PostCopyToFolder, folder);
    }

    emit_global(&mut out, &mut seen, items, ActionPhase::PostCopy);
    out
}

/// The `remove_*` mirror of [`schedule_copy`]. `remove_item` entries
/// absent from `item.actions` default to deleting the files the copy
/// would have produced; an item with an explicit empty `remove_item`
/// list disables deletion (callers signal this by simply never adding a
/// `RemoveItem`-phase entry and passing `default_remove: false`).
pub fn schedule_remove(items: &[Item], default_remove: bool) -> Vec<Command> {
    let mut seen: HashSet<(ActionPhase, Scope, String)> = HashSet::new();
    let mut out = Vec::new();

    emit_global(&mut out, &mut seen, items, ActionPhase::PreRemove);

    let folders = folder_union(items);
    for folder in &folders {
        emit_scoped(&mut out, &mut seen, items, ActionPhase::PreRemoveFromFolder, folder);

        for item in items.iter().filter(|i| i.folders.contains(folder)) {
            for source in &item.sources {
                emit_item_scoped(&mut out, &mut seen, item, ActionPhase::PreRemoveItem, source);

                let explicit: Vec<&str> = item.actions_for(ActionPhase::RemoveItem).collect();
                if !explicit.is_empty() {
                    for cmd in explicit {
                        push_once(&mut out, &mut seen, ActionPhase::RemoveItem, Scope::Item(item.iid.clone(), source.path.clone()), cmd.to_string());
                    }
                } else if default_remove {
                    out.push(Command::RmFileOrDir(
                        format!("{folder}/{}", basename(&source.path)),
                    ));
                }

                emit_item_scoped(&mut out, &mut seen, item, ActionPhase::PostRemoveItem, source);
            }
        }

        emit_scoped(&mut out, &mut seen, items, ActionPhase::PostRemoveFromFolder, folder);
    }

    emit_global(&mut out, &mut seen, items, ActionPhase::PostRemove);
    out
}

/// Map a resolved source to the copy primitive its kind requires:
/// `!dir` copies the whole subtree under the folder, `!dir_cont` copies
/// only its contents, `!file`/`!files` copy the single path as a file.
fn copy_command_for(source: &Source, folder: &str) -> Command {
    match source.kind {
        SourceKind::Dir => Command::CopyDirToDir {
            src: source.path.clone(),
            dst: folder.to_string(),
            hardlink_dest: None,
            ignore_globs: Vec::new(),
        },
        SourceKind::DirCont => Command::CopyDirContentsToDir {
            src: source.path.clone(),
            dst: folder.to_string(),
            hardlink_dest: None,
            ignore_globs: Vec::new(),
        },
        SourceKind::File | SourceKind::Files => Command::CopyFileToDir {
            src: source.path.clone(),
            dst: folder.to_string(),
        },
    }
}

fn folder_union(items: &[Item]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in items {
        for folder in &item.folders {
            if seen.insert(folder.clone()) {
                out.push(folder.clone());
            }
        }
    }
    out
}

fn emit_global(out: &mut Vec<Command>, seen: &mut HashSet<(ActionPhase, Scope, String)>, items: &[Item], phase: ActionPhase) {
    for item in items {
        for cmd in item.actions_for(phase) {
            push_once(out, seen, phase, Scope::None, cmd.to_string());
        }
    }
}

fn emit_scoped(out: &mut Vec<Command>, seen: &mut HashSet<(ActionPhase, Scope, String)>, items: &[Item], phase: ActionPhase, folder: &str) {
    for item in items.iter().filter(|i| i.folders.iter().any(|f| f == folder)) {
        for cmd in item.actions_for(phase) {
            push_once(out, seen, phase, Scope::Folder(folder.to_string()), cmd.to_string());
        }
    }
}

fn emit_item_scoped(out: &mut Vec<Command>, seen: &mut HashSet<(ActionPhase, Scope, String)>, item: &Item, phase: ActionPhase, source: &Source) {
    for cmd in item.actions_for(phase) {
        push_once(
            out,
            seen,
            phase,
            Scope::Item(item.iid.clone(), source.path.clone()),
            cmd.to_string(),
        );
    }
}

fn push_once(out: &mut Vec<Command>, seen: &mut HashSet<(ActionPhase, Scope, String)>, phase: ActionPhase, scope: Scope, command: String) {
    if seen.insert((phase, scope, command.clone())) {
        out.push(Command::SingleShellCommand(command));
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceKind;

    fn source(path: &str) -> Source {
        Source {
            path: path.to_string(),
            kind: SourceKind::File,
        }
    }

    #[test]
    fn duplicate_pre_copy_across_iids_runs_once() {
        let items = vec![
            Item {
                iid: Iid::from("A"),
                folders: vec!["/opt".to_string()],
                sources: vec![source("a")],
                actions: vec![(ActionPhase::PreCopy, "echo shared".to_string())],
            },
            Item {
                iid: Iid::from("B"),
                folders: vec!["/opt".to_string()],
                sources: vec![source("b")],
                actions: vec![(ActionPhase::PreCopy, "echo shared".to_string())],
            },
        ];

        let commands = schedule_copy(&items);
        let shared_count = commands
            .iter()
            .filter(|c| matches!(c, Command::SingleShellCommand(s) if s == "echo shared"))
            .count();
        assert_eq!(shared_count, 1);
    }

    #[test]
    fn copy_commands_are_emitted_per_source_in_folder_scope() {
        let items = vec![Item {
            iid: Iid::from("A"),
            folders: vec!["/opt".to_string()],
            sources: vec![source("a"), source("b")],
            actions: vec![],
        }];

        let commands = schedule_copy(&items);
        let copy_count = commands.iter().filter(|c| matches!(c, Command::CopyFileToDir { .. })).count();
        assert_eq!(copy_count, 2);
    }

    #[test]
    fn remove_item_defaults_to_deleting_what_copy_produced() {
        let items = vec![Item {
            iid: Iid::from("A"),
            folders: vec!["/opt".to_string()],
            sources: vec![source("a")],
            actions: vec![],
        }];

        let commands = schedule_remove(&items, true);
        assert!(commands.iter().any(|c| matches!(c, Command::RmFileOrDir(p) if p == "/opt/a")));
    }

    #[test]
    fn remove_item_disabled_when_default_remove_is_false() {
        let items = vec![Item {
            iid: Iid::from("A"),
            folders: vec!["/opt".to_string()],
            sources: vec![source("a")],
            actions: vec![],
        }];

        let commands = schedule_remove(&items, false);
        assert!(!commands.iter().any(|c| matches!(c, Command::RmFileOrDir(_))));
    }
}
