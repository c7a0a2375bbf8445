//! Boundary with the compiler / delta engine.
//!
//! The engine turns changed files into updates. The session only sees its
//! verdict, its diagnostics and the updates themselves.

use std::fmt;

use async_trait::async_trait;

use crate::change::ChangeEvent;
use crate::update::{Capabilities, ModuleId, StaticAsset, Update};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    /// Nothing to apply.
    NoChanges,
    /// Compilation errors; nothing is produced until they are fixed.
    Blocked,
    /// Some edit cannot be applied to a running process.
    RestartRequired,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagnosticSeverity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for DiagnosticSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticSeverity::Error => f.write_str("error"),
            DiagnosticSeverity::Warning => f.write_str("warning"),
            DiagnosticSeverity::Info => f.write_str("info"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub id: String,
    pub severity: DiagnosticSeverity,
    pub message: String,
    /// An edit no running process can apply in place.
    pub is_rude_edit: bool,
}

impl Diagnostic {
    pub fn new(
        id: impl Into<String>,
        severity: DiagnosticSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            severity,
            message: message.into(),
            is_rude_edit: false,
        }
    }

    pub fn rude_edit(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            is_rude_edit: true,
            ..Self::new(id, DiagnosticSeverity::Error, message)
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.severity, self.id, self.message)
    }
}

/// Everything the engine produced for one batch of changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateBatch {
    pub status: UpdateStatus,
    pub updates: Vec<Update>,
    pub diagnostics: Vec<Diagnostic>,
    /// Modules whose edits can only take effect after a restart.
    pub restart_required: Vec<ModuleId>,
    pub static_assets: Vec<StaticAsset>,
}

impl UpdateBatch {
    pub fn empty(status: UpdateStatus) -> Self {
        Self {
            status,
            updates: Vec::new(),
            diagnostics: Vec::new(),
            restart_required: Vec::new(),
            static_assets: Vec::new(),
        }
    }

    pub fn ready(updates: Vec<Update>) -> Self {
        Self {
            updates,
            ..Self::empty(UpdateStatus::Ready)
        }
    }

    pub fn restart(modules: Vec<ModuleId>, diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            restart_required: modules,
            diagnostics,
            ..Self::empty(UpdateStatus::RestartRequired)
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Vec<Diagnostic>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_static_assets(mut self, assets: Vec<StaticAsset>) -> Self {
        self.static_assets = assets;
        self
    }
}

#[async_trait]
pub trait DeltaEngine: Send + Sync {
    /// Compute updates for `changed`, producing only what `capabilities` allow.
    async fn produce_updates(
        &self,
        capabilities: &Capabilities,
        changed: &[ChangeEvent],
    ) -> UpdateBatch;

    /// Treat the current code of `modules` as the new starting point.
    async fn update_baselines(&self, modules: &[ModuleId]);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Hands out pre-built batches in order and records what it was asked.
    #[derive(Default)]
    pub(crate) struct QueuedEngine {
        batches: Mutex<VecDeque<UpdateBatch>>,
        pub(crate) requests: Mutex<Vec<(Capabilities, Vec<ChangeEvent>)>>,
        pub(crate) rebased: Mutex<Vec<ModuleId>>,
    }

    impl QueuedEngine {
        pub(crate) fn new(batches: impl IntoIterator<Item = UpdateBatch>) -> Self {
            Self {
                batches: Mutex::new(batches.into_iter().collect()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl DeltaEngine for QueuedEngine {
        async fn produce_updates(
            &self,
            capabilities: &Capabilities,
            changed: &[ChangeEvent],
        ) -> UpdateBatch {
            self.requests
                .lock()
                .push((capabilities.clone(), changed.to_vec()));
            self.batches
                .lock()
                .pop_front()
                .unwrap_or_else(|| UpdateBatch::empty(UpdateStatus::NoChanges))
        }

        async fn update_baselines(&self, modules: &[ModuleId]) {
            self.rebased.lock().extend_from_slice(modules);
        }
    }
}
