use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::models::{ResultSet, StageType};

/// Snapshot pushed to observers after every stage transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    /// Stage currently running (or the one that just finished/failed)
    pub current_stage: Option<String>,
    /// Stage types completed so far, in completion order
    pub completed: Vec<StageType>,
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Push-style progress sink
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, update: &ProgressUpdate);
}

/// Observer that writes progress to the log
#[derive(Debug, Default)]
pub struct LoggingObserver;

impl ProgressObserver for LoggingObserver {
    fn on_progress(&self, update: &ProgressUpdate) {
        let stage = update.current_stage.as_deref().unwrap_or("-");
        match &update.error {
            Some(error) => warn!(
                "[{}/{}] {} failed: {}",
                update.completed.len(),
                update.total,
                stage,
                error
            ),
            None => info!("[{}/{}] {}", update.completed.len(), update.total, stage),
        }
    }
}

/// Observer that keeps every update it receives
#[derive(Debug, Default)]
pub struct RecordingObserver {
    updates: Mutex<Vec<ProgressUpdate>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<ProgressUpdate> {
        self.updates.lock().clone()
    }

    pub fn last(&self) -> Option<ProgressUpdate> {
        self.updates.lock().last().cloned()
    }
}

impl ProgressObserver for RecordingObserver {
    fn on_progress(&self, update: &ProgressUpdate) {
        self.updates.lock().push(update.clone());
    }
}

/// Builds updates from the live results of a run and pushes them to an
/// observer
#[derive(Clone, Copy)]
pub struct ProgressReporter<'a> {
    observer: &'a dyn ProgressObserver,
    total: usize,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(observer: &'a dyn ProgressObserver, total: usize) -> Self {
        Self { observer, total }
    }

    pub fn stage_started(&self, stage: &str, results: &ResultSet) {
        self.notify(Some(stage), results, None);
    }

    pub fn stage_completed(&self, stage: &str, results: &ResultSet) {
        self.notify(Some(stage), results, None);
    }

    pub fn stage_failed(&self, stage: &str, results: &ResultSet, error: &str) {
        self.notify(Some(stage), results, Some(error.to_string()));
    }

    pub fn run_finished(&self, results: &ResultSet) {
        self.notify(None, results, None);
    }

    fn notify(&self, stage: Option<&str>, results: &ResultSet, error: Option<String>) {
        self.observer.on_progress(&ProgressUpdate {
            current_stage: stage.map(str::to_string),
            completed: results.completed_types(),
            total: self.total,
            error,
        });
    }
}
