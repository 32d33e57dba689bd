//! Encode progress recording.

use tracing::info;

/// Granularity of recorded progress, in percent.
pub const PROGRESS_STEP: u8 = 5;

/// Records encode progress reported by the engine.
///
/// Only percentages that are a multiple of [`PROGRESS_STEP`] are kept; each
/// recorded milestone is logged with the worker's process id.
#[derive(Debug, Clone)]
pub struct ProgressRecorder {
    pid: u32,
    name: String,
    latest: Option<u8>,
    milestones: Vec<u8>,
}

impl ProgressRecorder {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_pid(std::process::id(), name)
    }

    pub fn with_pid(pid: u32, name: impl Into<String>) -> Self {
        Self {
            pid,
            name: name.into(),
            latest: None,
            milestones: Vec::new(),
        }
    }

    /// Observe one progress event.
    pub fn observe(&mut self, percentage: u8) {
        if percentage % PROGRESS_STEP != 0 {
            return;
        }

        self.latest = Some(percentage);
        self.milestones.push(percentage);
        info!(
            pid = self.pid,
            "PID: {}, {}% of {} transcoded", self.pid, percentage, self.name
        );
    }

    /// Latest recorded percentage.
    pub fn latest(&self) -> Option<u8> {
        self.latest
    }

    /// Every recorded percentage, in arrival order.
    pub fn milestones(&self) -> &[u8] {
        &self.milestones
    }
}
