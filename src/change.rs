//! File change coalescing.
//!
//! The watcher reports every raw notification it sees. Editors routinely
//! produce bursts such as "create temp, write, delete" or "delete, recreate"
//! for a single save, so changes are accumulated for a short window and then
//! reduced to at most one net event per path.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Add,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Add => "add",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    pub fn add(path: impl Into<PathBuf>) -> Self {
        Self::new(path, ChangeKind::Add)
    }

    pub fn update(path: impl Into<PathBuf>) -> Self {
        Self::new(path, ChangeKind::Update)
    }

    pub fn delete(path: impl Into<PathBuf>) -> Self {
        Self::new(path, ChangeKind::Delete)
    }
}

/// Reduce a sequence of events to at most one event per path.
///
/// Paths keep the order in which they first appear. Within a path:
/// - consecutive events of the same kind collapse,
/// - add followed (through any updates) by delete cancels out,
/// - delete followed by add becomes an update,
/// - updates after a surviving add are dropped,
/// - of what survives, delete wins over add, add over update.
pub fn normalize<I>(events: I) -> Vec<ChangeEvent>
where
    I: IntoIterator<Item = ChangeEvent>,
{
    let mut order: Vec<PathBuf> = Vec::new();
    let mut groups: HashMap<PathBuf, Vec<ChangeKind>> = HashMap::new();

    for event in events {
        match groups.get_mut(&event.path) {
            Some(kinds) => kinds.push(event.kind),
            None => {
                order.push(event.path.clone());
                groups.insert(event.path, vec![event.kind]);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|path| {
            let kinds = groups.remove(&path)?;
            reduce(&kinds).map(|kind| ChangeEvent { path, kind })
        })
        .collect()
}

fn reduce(kinds: &[ChangeKind]) -> Option<ChangeKind> {
    let mut last_update = None;
    let mut last_delete = None;
    let mut last_add = None;
    let mut previous = None;

    for &kind in kinds {
        if previous == Some(kind) {
            continue;
        }
        previous = Some(kind);

        match kind {
            ChangeKind::Add => {
                if last_delete.is_some() {
                    // delete-(update)*-add: the file was replaced
                    last_delete = None;
                    last_add = None;
                    if last_update.is_none() {
                        last_update = Some(ChangeKind::Update);
                    }
                } else {
                    last_add = Some(kind);
                }
            }
            ChangeKind::Delete => {
                if last_add.is_some() {
                    // add-delete: a transient file
                    last_delete = None;
                    last_add = None;
                } else {
                    last_delete = Some(kind);
                    last_update = None;
                }
            }
            ChangeKind::Update => {
                if last_add.is_none() {
                    last_update = Some(kind);
                }
            }
        }
    }

    last_delete.or(last_add).or(last_update)
}

/// Human-readable summary of a normalized batch, one line per kind.
pub fn summarize(changes: &[ChangeEvent], root: Option<&Path>) -> Vec<String> {
    [ChangeKind::Add, ChangeKind::Update, ChangeKind::Delete]
        .into_iter()
        .filter_map(|kind| {
            let paths: Vec<String> = changes
                .iter()
                .filter(|c| c.kind == kind)
                .map(|c| display_path(&c.path, root))
                .collect();

            match paths.as_slice() {
                [] => None,
                [single] => Some(format!("{}: {}", singular(kind), single)),
                many => Some(format!("{}: {}", plural(kind), many.join(", "))),
            }
        })
        .collect()
}

fn singular(kind: ChangeKind) -> &'static str {
    match kind {
        ChangeKind::Add => "File added",
        ChangeKind::Update => "File updated",
        ChangeKind::Delete => "File deleted",
    }
}

fn plural(kind: ChangeKind) -> &'static str {
    match kind {
        ChangeKind::Add => "Files added",
        ChangeKind::Update => "Files updated",
        ChangeKind::Delete => "Files deleted",
    }
}

fn display_path(path: &Path, root: Option<&Path>) -> String {
    root.and_then(|root| path.strip_prefix(root).ok())
        .unwrap_or(path)
        .display()
        .to_string()
}

/// Collects raw watcher events between batches.
///
/// The caller waits [`window`](Self::window) between polls. A batch that
/// contains an addition or deletion is held for one extra (longer) window so
/// the other half of a move or temp-file dance can arrive.
pub struct ChangeAccumulator {
    pending: Vec<ChangeEvent>,
    debounce: Duration,
    extended_debounce: Duration,
    extended: bool,
}

impl ChangeAccumulator {
    pub fn new(debounce: Duration, extended_debounce: Duration) -> Self {
        Self {
            pending: Vec::new(),
            debounce,
            extended_debounce,
            extended: false,
        }
    }

    pub fn push(&mut self, event: ChangeEvent) {
        tracing::trace!(kind = %event.kind, path = %event.path.display(), "File change");
        self.pending.push(event);
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = ChangeEvent>) {
        for event in events {
            self.push(event);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn window(&self) -> Duration {
        if self.extended {
            self.extended_debounce
        } else {
            self.debounce
        }
    }

    /// Take the accumulated changes once the window allows it.
    ///
    /// Returns `None` when there is nothing to do yet, including when every
    /// pending event cancelled out.
    pub fn poll_batch(&mut self) -> Option<Vec<ChangeEvent>> {
        if !self.extended
            && self
                .pending
                .iter()
                .any(|c| matches!(c.kind, ChangeKind::Add | ChangeKind::Delete))
        {
            self.extended = true;
            return None;
        }

        self.extended = false;

        if self.pending.is_empty() {
            return None;
        }

        let batch = normalize(std::mem::take(&mut self.pending));
        if batch.is_empty() {
            tracing::debug!("Accumulated changes cancelled out");
            return None;
        }
        Some(batch)
    }

    /// Discard everything accumulated so far.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.extended = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(events: &[ChangeEvent]) -> Vec<(String, ChangeKind)> {
        events
            .iter()
            .map(|e| (e.path.display().to_string(), e.kind))
            .collect()
    }

    #[test]
    fn add_then_delete_cancels() {
        assert!(normalize([ChangeEvent::add("a.rs"), ChangeEvent::delete("a.rs")]).is_empty());
    }

    #[test]
    fn add_update_delete_cancels() {
        let events = [
            ChangeEvent::add("a.rs"),
            ChangeEvent::update("a.rs"),
            ChangeEvent::update("a.rs"),
            ChangeEvent::delete("a.rs"),
        ];
        assert!(normalize(events).is_empty());
    }

    #[test]
    fn delete_then_add_becomes_update() {
        let result = normalize([ChangeEvent::delete("a.rs"), ChangeEvent::add("a.rs")]);
        assert_eq!(result, vec![ChangeEvent::update("a.rs")]);
    }

    #[test]
    fn repeated_kinds_collapse() {
        for kind in [ChangeKind::Add, ChangeKind::Update, ChangeKind::Delete] {
            let events = vec![ChangeEvent::new("x", kind); 4];
            assert_eq!(normalize(events), vec![ChangeEvent::new("x", kind)]);
        }
    }

    #[test]
    fn updates_after_add_are_ignored() {
        let result = normalize([ChangeEvent::add("a.rs"), ChangeEvent::update("a.rs")]);
        assert_eq!(result, vec![ChangeEvent::add("a.rs")]);
    }

    #[test]
    fn delete_wins_over_earlier_update() {
        let result = normalize([ChangeEvent::update("a.rs"), ChangeEvent::delete("a.rs")]);
        assert_eq!(result, vec![ChangeEvent::delete("a.rs")]);
    }

    #[test]
    fn replaced_file_followed_by_edit_stays_update() {
        let events = [
            ChangeEvent::delete("a.rs"),
            ChangeEvent::add("a.rs"),
            ChangeEvent::update("a.rs"),
        ];
        assert_eq!(normalize(events), vec![ChangeEvent::update("a.rs")]);
    }

    #[test]
    fn paths_are_independent_and_keep_first_seen_order() {
        let events = [
            ChangeEvent::update("b.rs"),
            ChangeEvent::add("a.rs"),
            ChangeEvent::update("c.rs"),
            ChangeEvent::delete("a.rs"),
            ChangeEvent::update("b.rs"),
        ];
        assert_eq!(
            kinds(&normalize(events)),
            vec![
                ("b.rs".to_string(), ChangeKind::Update),
                ("c.rs".to_string(), ChangeKind::Update),
            ]
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        let samples: Vec<Vec<ChangeEvent>> = vec![
            vec![ChangeEvent::delete("a"), ChangeEvent::add("a"), ChangeEvent::update("b")],
            vec![ChangeEvent::add("a"), ChangeEvent::update("a"), ChangeEvent::delete("c")],
            vec![ChangeEvent::update("a"), ChangeEvent::delete("a"), ChangeEvent::add("b")],
            vec![],
        ];

        for sample in samples {
            let once = normalize(sample);
            let twice = normalize(once.clone());
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn summary_groups_by_kind() {
        let root = Path::new("/src");
        let changes = vec![
            ChangeEvent::update("/src/a.rs"),
            ChangeEvent::add("/src/b.rs"),
            ChangeEvent::update("/src/c.rs"),
        ];
        assert_eq!(
            summarize(&changes, Some(root)),
            vec![
                "File added: b.rs".to_string(),
                "Files updated: a.rs, c.rs".to_string(),
            ]
        );
    }

    #[test]
    fn accumulator_holds_additions_for_one_extended_window() {
        let mut acc = ChangeAccumulator::new(Duration::from_millis(50), Duration::from_millis(200));
        acc.push(ChangeEvent::add("tmp.rs"));

        assert_eq!(acc.window(), Duration::from_millis(50));
        assert!(acc.poll_batch().is_none());
        assert_eq!(acc.window(), Duration::from_millis(200));

        acc.push(ChangeEvent::delete("tmp.rs"));
        assert!(acc.poll_batch().is_none());
        assert!(acc.is_empty());
        assert_eq!(acc.window(), Duration::from_millis(50));
    }

    #[test]
    fn accumulator_releases_updates_immediately() {
        let mut acc = ChangeAccumulator::new(Duration::from_millis(50), Duration::from_millis(200));
        acc.extend([ChangeEvent::update("a.rs"), ChangeEvent::update("a.rs")]);

        assert_eq!(acc.poll_batch(), Some(vec![ChangeEvent::update("a.rs")]));
        assert!(acc.poll_batch().is_none());
    }
}
