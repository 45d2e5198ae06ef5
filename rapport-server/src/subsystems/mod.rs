pub mod consolidate;
pub mod hygiene;
pub mod maintenance;
pub mod mentions;
pub mod proximity;
pub mod query;
pub mod recorder;
pub mod rolling;
pub mod rollup;
pub mod segmenter;

use serde::Serialize;

/// Outcome of a chunked, checkpointed batch job.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub processed: usize,
    pub failed: usize,
    pub batches: usize,
    /// Cursor the job resumed from, if an earlier run was interrupted
    pub resumed_from: Option<String>,
    pub errors: Vec<String>,
}

impl BatchReport {
    pub(crate) fn record_error(&mut self, item: &str, err: impl std::fmt::Display) {
        self.failed += 1;
        self.errors.push(format!("{}: {}", item, err));
    }
}
