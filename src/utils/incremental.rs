// Change tracking for incremental rebuilds.
// Decides which graph nodes a set of changed paths actually invalidates and
// remembers paths whose rebuild failed so the next attempt picks them up.

use crate::core::graph::ModuleGraph;
use crate::core::models::ModuleId;
use crate::utils::{ContentHasher, Logger};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// What a changed path means for the current graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    /// Content differs from the hash recorded in the graph.
    Modified(Vec<ModuleId>),
    /// Same bytes as before; nothing to do.
    Unchanged,
    /// Backing file is gone or unreadable.
    Missing(Vec<ModuleId>),
    /// Not part of the graph. May satisfy a previously unresolved import,
    /// shadow an existing resolution, or be a file a transform read.
    Untracked,
}

/// Everything a rebuild must redo for a set of changed paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Modules whose own file changed or disappeared, in id order.
    pub dirty: Vec<ModuleId>,
    /// Modules whose output was built from a changed non-module file.
    pub stale: Vec<ModuleId>,
    /// An untracked path exists on disk, so resolutions may have changed.
    pub relink: bool,
}

impl ChangeSet {
    pub fn len(&self) -> usize {
        self.dirty.len() + self.stale.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirty.is_empty() && self.stale.is_empty() && !self.relink
    }
}

#[derive(Debug, Clone, Default)]
pub struct IncrementalState {
    /// Paths from rebuilds that did not complete.
    pending: BTreeSet<PathBuf>,
}

impl IncrementalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Keep `paths` for the next rebuild.
    pub fn defer(&mut self, paths: impl IntoIterator<Item = PathBuf>) {
        self.pending.extend(paths);
    }

    /// Changed paths merged with everything deferred, deduplicated.
    pub fn take_with(&mut self, changed: impl IntoIterator<Item = PathBuf>) -> Vec<PathBuf> {
        let mut paths = std::mem::take(&mut self.pending);
        paths.extend(changed);
        paths.into_iter().collect()
    }

    pub fn classify(graph: &ModuleGraph, hasher: &ContentHasher, path: &Path) -> FileChange {
        let ids = graph.ids_for_path(path);
        if ids.is_empty() {
            return FileChange::Untracked;
        }

        let Ok(bytes) = std::fs::read(path) else {
            return FileChange::Missing(ids);
        };
        let hash = hasher.digest(&bytes);
        let modified: Vec<ModuleId> = ids
            .into_iter()
            .filter(|id| graph.node(*id).map_or(false, |n| n.content_hash != hash))
            .collect();

        if modified.is_empty() {
            FileChange::Unchanged
        } else {
            FileChange::Modified(modified)
        }
    }

    /// Modules with a recorded output that was built from `path`.
    pub fn dependents_of_file(graph: &ModuleGraph, path: &Path) -> Vec<ModuleId> {
        graph
            .nodes()
            .filter(|node| node.output.as_ref().map_or(false, |out| out.depends_on(path)))
            .map(|node| node.id)
            .collect()
    }

    pub fn changes(graph: &ModuleGraph, hasher: &ContentHasher, paths: &[PathBuf]) -> ChangeSet {
        let mut dirty = BTreeSet::new();
        let mut stale = BTreeSet::new();
        let mut relink = false;
        for path in paths {
            match Self::classify(graph, hasher, path) {
                FileChange::Modified(ids) | FileChange::Missing(ids) => dirty.extend(ids),
                FileChange::Unchanged => {
                    Logger::debug(&format!("{} is unchanged", path.display()));
                }
                FileChange::Untracked => {
                    stale.extend(Self::dependents_of_file(graph, path));
                    relink |= path.exists();
                }
            }
        }
        ChangeSet {
            stale: stale.difference(&dirty).copied().collect(),
            dirty: dirty.into_iter().collect(),
            relink,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deferred_paths_are_merged_once() {
        let mut state = IncrementalState::new();
        state.defer(vec![PathBuf::from("/p/a.js"), PathBuf::from("/p/b.js")]);
        assert!(state.has_pending());

        let paths = state.take_with(vec![PathBuf::from("/p/b.js"), PathBuf::from("/p/c.js")]);
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/p/a.js"),
                PathBuf::from("/p/b.js"),
                PathBuf::from("/p/c.js")
            ]
        );
        assert!(!state.has_pending());
    }

    #[test]
    fn test_untracked_path() {
        let graph = ModuleGraph::new();
        let hasher = ContentHasher::new(Default::default());
        assert_eq!(
            IncrementalState::classify(&graph, &hasher, Path::new("/nowhere.js")),
            FileChange::Untracked
        );

        // Deleting a file nobody knows about changes nothing.
        let changes = IncrementalState::changes(&graph, &hasher, &[PathBuf::from("/nowhere.js")]);
        assert!(changes.is_empty());
    }

    #[test]
    fn test_created_file_requests_relink() {
        let dir = tempfile::tempdir().unwrap();
        let created = dir.path().join("x.ts");
        std::fs::write(&created, "export const x = 1;").unwrap();

        let graph = ModuleGraph::new();
        let hasher = ContentHasher::new(Default::default());
        let changes = IncrementalState::changes(&graph, &hasher, &[created]);
        assert!(changes.relink);
        assert!(changes.dirty.is_empty());
        assert!(changes.stale.is_empty());
    }
}
