use crate::cancel::CancellationToken;
use crate::error::{EngineError, Halt, StageResult};
use crate::memory::MemoryMonitor;
use crate::progress::ProgressReporter;

/// Per-job handles passed to every pipeline stage. `memory` is set only when a
/// monitor is running.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub token: &'a CancellationToken,
    pub progress: &'a ProgressReporter,
    pub memory: Option<&'a MemoryMonitor>,
}

impl<'a> StageContext<'a> {
    pub fn new(token: &'a CancellationToken, progress: &'a ProgressReporter) -> Self {
        Self {
            token,
            progress,
            memory: None,
        }
    }

    pub fn with_memory(mut self, memory: &'a MemoryMonitor) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Cancellation check plus the sustained memory-emergency abort.
    pub fn safe_point(&self) -> StageResult<()> {
        self.token.safe_point()?;
        if self.memory.is_some_and(MemoryMonitor::sustained_emergency) {
            return Err(Halt::Failed(EngineError::ResourceExhausted(
                "memory stayed at emergency level".into(),
            )));
        }
        Ok(())
    }

    /// Population size after memory bounding.
    pub fn population(&self, default: usize) -> usize {
        self.memory.map_or(default, |m| m.bounded_population(default))
    }
}
