use tracing::warn;

use crate::event::stage_label;

/// Execution status of one stage invocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

/// One stage invocation within a turn, in the order stages started.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StageStep {
    pub stage_id: String,
    pub display_label: String,
    pub status: StepStatus,
    pub started_at_ms: u64,
    /// `None` while running; fixed once the step leaves `Running`.
    pub elapsed_ms: Option<u64>,
}

impl StageStep {
    /// Elapsed time as of `now_ms`, live for a running step.
    pub fn elapsed_at(&self, now_ms: u64) -> u64 {
        self.elapsed_ms
            .unwrap_or_else(|| now_ms.saturating_sub(self.started_at_ms))
    }

    fn settle(&mut self, status: StepStatus, now_ms: u64) {
        self.status = status;
        self.elapsed_ms = Some(now_ms.saturating_sub(self.started_at_ms));
    }
}

/// Ordered stage steps for the current pipeline run.
///
/// Steps are only appended or updated in place by index; they are never
/// reordered or removed mid-turn.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProgressTracker {
    steps: Vec<StageStep>,
}

impl ProgressTracker {
    pub fn steps(&self) -> &[StageStep] {
        &self.steps
    }

    pub fn clear(&mut self) {
        self.steps.clear();
    }

    /// Index of the step currently running, if any.
    pub fn running(&self) -> Option<usize> {
        self.steps
            .iter()
            .rposition(|step| step.status == StepStatus::Running)
    }

    /// Appends a running step and returns its index.
    ///
    /// A step still running at this point is treated as abandoned: it is
    /// marked failed, never completed.
    pub fn stage_started(&mut self, stage_id: &str, now_ms: u64) -> usize {
        if let Some(idx) = self.running() {
            let abandoned = &mut self.steps[idx];
            warn!(
                abandoned = %abandoned.stage_id,
                next = stage_id,
                "stage started while another stage was still running"
            );
            abandoned.settle(StepStatus::Failed, now_ms);
        }
        self.steps.push(StageStep {
            stage_id: stage_id.to_string(),
            display_label: stage_label(stage_id).to_string(),
            status: StepStatus::Running,
            started_at_ms: now_ms,
            elapsed_ms: None,
        });
        self.steps.len() - 1
    }

    /// Completes the most recent running step for `stage_id`.
    ///
    /// Returns `None` and leaves the steps untouched when nothing matches.
    pub fn stage_completed(&mut self, stage_id: &str, now_ms: u64) -> Option<usize> {
        let Some(idx) = self
            .steps
            .iter()
            .rposition(|step| step.stage_id == stage_id && step.status == StepStatus::Running)
        else {
            warn!(stage_id, "completion without a matching running stage");
            return None;
        };
        self.steps[idx].settle(StepStatus::Completed, now_ms);
        Some(idx)
    }

    /// Marks the running step failed, if any, without touching completed ones.
    pub fn abandon_running(&mut self, now_ms: u64) -> Option<usize> {
        let idx = self.running()?;
        self.steps[idx].settle(StepStatus::Failed, now_ms);
        Some(idx)
    }

    /// Attributes a turn failure to a step.
    ///
    /// The running step fails with its elapsed time computed now; with none
    /// running, the last step is re-marked failed if it had completed, keeping
    /// its recorded elapsed time.
    pub fn fail_in_flight(&mut self, now_ms: u64) -> Option<usize> {
        if let Some(idx) = self.abandon_running(now_ms) {
            return Some(idx);
        }
        let last = self.steps.last_mut()?;
        if last.status == StepStatus::Completed {
            last.status = StepStatus::Failed;
            return Some(self.steps.len() - 1);
        }
        None
    }
}

/// Formats a duration for display: `850ms`, `1.5s`.
pub fn format_elapsed(ms: u64) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}
