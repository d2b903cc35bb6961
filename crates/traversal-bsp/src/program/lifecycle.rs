//! Program state machine
//!
//! ```text
//! Uninitialized ──load──▶ Loaded ──setup──▶ Ready ──iterate──▶ Running ─┐
//!                                                                │  ▲    │
//!                                                                │  └────┘
//!                                                                ▼
//!                                                           Terminated
//! ```
//!
//! Any non-final phase may move to `Failed`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::BspError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramPhase {
    Uninitialized,
    Loaded,
    Ready,
    Running,
    Terminated,
    Failed,
}

impl ProgramPhase {
    pub fn is_final(&self) -> bool {
        matches!(self, ProgramPhase::Terminated | ProgramPhase::Failed)
    }

    fn can_move_to(&self, to: ProgramPhase) -> bool {
        use ProgramPhase::*;
        match (self, to) {
            (Uninitialized, Loaded) => true,
            (Loaded, Ready) => true,
            (Ready, Running) | (Running, Running) => true,
            (Running, Terminated) => true,
            (from, Failed) => !from.is_final(),
            _ => false,
        }
    }
}

impl fmt::Display for ProgramPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProgramPhase::Uninitialized => "uninitialized",
            ProgramPhase::Loaded => "loaded",
            ProgramPhase::Ready => "ready",
            ProgramPhase::Running => "running",
            ProgramPhase::Terminated => "terminated",
            ProgramPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks which hooks a driver may call next
#[derive(Debug, Clone)]
pub struct ProgramLifecycle {
    phase: ProgramPhase,
    iterations: usize,
}

impl Default for ProgramLifecycle {
    fn default() -> Self {
        Self {
            phase: ProgramPhase::Uninitialized,
            iterations: 0,
        }
    }
}

impl ProgramLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> ProgramPhase {
        self.phase
    }

    /// Completed or in-flight iterations
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn loaded(&mut self) -> Result<(), BspError> {
        self.move_to(ProgramPhase::Loaded)
    }

    /// Setup ran; allowed once, right after loading
    pub fn setup_done(&mut self) -> Result<(), BspError> {
        self.move_to(ProgramPhase::Ready)
    }

    pub fn begin_iteration(&mut self) -> Result<(), BspError> {
        self.move_to(ProgramPhase::Running)?;
        self.iterations += 1;
        Ok(())
    }

    pub fn terminated(&mut self) -> Result<(), BspError> {
        self.move_to(ProgramPhase::Terminated)
    }

    /// Record an aborted run; a no-op once the lifecycle is final
    pub fn failed(&mut self) {
        if !self.phase.is_final() {
            self.phase = ProgramPhase::Failed;
        }
    }

    fn move_to(&mut self, to: ProgramPhase) -> Result<(), BspError> {
        if !self.phase.can_move_to(to) {
            return Err(BspError::IllegalTransition {
                from: self.phase.to_string(),
                to: to.to_string(),
            });
        }
        tracing::trace!(from = %self.phase, to = %to, "program phase");
        self.phase = to;
        Ok(())
    }
}
