//! Filter predicates for raw filesystem events
//!
//! Watches deliver every change under the watched directories; these filters
//! decide which raw events actually warrant a re-scan. Filters combine with
//! OR semantics, and an empty set passes everything: over-triggering a scan
//! is acceptable, missing a real state change is not.

use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::Event;
use std::path::{Path, PathBuf};

/// Kubelet state files whose creation signals a resource-allocation change.
pub const KUBELET_STATE_FILES: [&str; 3] = [
    "cpu_manager_state",
    "memory_manager_state",
    "kubelet_internal_checkpoint",
];

/// Predicate over a raw filesystem event.
pub trait FsEventFilter: Send + Sync {
    fn matches(&self, event: &Event) -> bool;
}

/// Fires on a write or permission change to exactly the notify-file path.
pub struct NotifyFileFilter {
    path: PathBuf,
}

impl NotifyFileFilter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FsEventFilter for NotifyFileFilter {
    fn matches(&self, event: &Event) -> bool {
        let relevant = matches!(
            event.kind,
            EventKind::Modify(ModifyKind::Data(_))
                | EventKind::Modify(ModifyKind::Metadata(_))
                | EventKind::Modify(ModifyKind::Any)
        );

        relevant && event.paths.iter().any(|p| p == &self.path)
    }
}

/// Fires when a well-known kubelet state file appears in a watched directory.
///
/// External writers use the rename-then-create pattern, so a rename-to is
/// treated as a create on the new name; the preceding rename-away of the old
/// name is ignored. This yields occasional false positives, never false
/// negatives.
pub struct StateDirFilter {
    dirs: Vec<PathBuf>,
}

impl StateDirFilter {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    fn is_state_file(&self, path: &Path) -> bool {
        let known_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| KUBELET_STATE_FILES.contains(&n))
            .unwrap_or(false);

        known_name
            && path
                .parent()
                .map(|parent| self.dirs.iter().any(|d| d == parent))
                .unwrap_or(false)
    }
}

impl FsEventFilter for StateDirFilter {
    fn matches(&self, event: &Event) -> bool {
        let created = matches!(
            event.kind,
            EventKind::Create(_)
                | EventKind::Modify(ModifyKind::Name(RenameMode::To))
        );

        created && event.paths.iter().any(|p| self.is_state_file(p))
    }
}

/// OR-combination of filters; passes everything when empty.
#[derive(Default)]
pub struct EventFilterSet {
    filters: Vec<Box<dyn FsEventFilter>>,
}

impl EventFilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, filter: Box<dyn FsEventFilter>) {
        self.filters.push(filter);
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|f| f.matches(event))
    }
}
