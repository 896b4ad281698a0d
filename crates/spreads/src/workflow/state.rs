//! Workflow step state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Capture,
    Process,
    Output,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Capture => "capture",
            Step::Process => "process",
            Step::Output => "output",
        }
    }
}

/// Externally visible status, serialized as `status`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Status {
    pub step: Option<Step>,
    pub step_done: bool,
    pub prepared: bool,
    pub step_progress: Option<f64>,
}

/// Coarse state used to check transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Capturing,
    Processing,
    Outputting,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Idle => "idle",
            Phase::Capturing => "capturing",
            Phase::Processing => "processing",
            Phase::Outputting => "outputting",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    PrepareCapture,
    Capture,
    FinishCapture,
    Process,
    Output,
    Rename,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::PrepareCapture => "prepare capture",
            Action::Capture => "capture",
            Action::FinishCapture => "finish capture",
            Action::Process => "process",
            Action::Output => "output",
            Action::Rename => "rename",
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowState {
    pub status: Status,
    /// Set while a process or output step runs.
    pub busy: bool,
    /// Epoch seconds of the first capture of the current session.
    pub capture_start: Option<i64>,
}

impl WorkflowState {
    pub fn phase(&self) -> Phase {
        if self.status.prepared {
            return Phase::Capturing;
        }
        match (self.busy, self.status.step) {
            (true, Some(Step::Process)) => Phase::Processing,
            (true, Some(Step::Output)) => Phase::Outputting,
            _ => Phase::Idle,
        }
    }

    /// Fails unless `action` is legal from the current phase.
    pub fn check(&self, action: Action) -> Result<(), WorkflowError> {
        let phase = self.phase();
        let legal = match action {
            Action::PrepareCapture => matches!(phase, Phase::Idle | Phase::Capturing),
            Action::Capture | Action::FinishCapture => phase == Phase::Capturing,
            Action::Process | Action::Output | Action::Rename => phase == Phase::Idle,
        };
        if legal {
            return Ok(());
        }
        if action == Action::Capture && phase == Phase::Idle {
            return Err(WorkflowError::NotPrepared);
        }
        Err(WorkflowError::IllegalTransition {
            current: phase.to_string(),
            attempted: action.to_string(),
        })
    }

    pub fn begin_capture(&mut self) {
        self.status.prepared = true;
        self.status.step = Some(Step::Capture);
        self.status.step_done = false;
        self.status.step_progress = None;
    }

    pub fn end_capture(&mut self) {
        self.status.prepared = false;
        self.status.step_done = true;
        self.capture_start = None;
    }

    pub fn begin_step(&mut self, step: Step) {
        self.busy = true;
        self.status.step = Some(step);
        self.status.step_done = false;
        self.status.step_progress = Some(0.0);
    }

    pub fn end_step(&mut self, success: bool) {
        self.busy = false;
        self.status.step_done = success;
        if success {
            self.status.step_progress = Some(1.0);
        }
    }
}
