//! Operator hand-off between `Started` and `Stopped`.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::session::DetachedProcess;
use crate::topology::Topology;
use crate::workflow::SpawnFailure;

/// What the operator gets to see while the session is interactive.
pub struct PromptContext<'a> {
    pub topology: &'a Topology,
    pub processes: &'a [DetachedProcess],
    /// Background processes that could not be started.
    pub failures: &'a [SpawnFailure],
    pub output_dir: &'a Path,
}

/// Holds control until the operator is done with the live session.
pub trait OperatorPrompt {
    fn interact(&mut self, ctx: &PromptContext<'_>) -> Result<()>;
}

/// Returns immediately.
#[derive(Debug, Default)]
pub struct ImmediatePrompt;

impl OperatorPrompt for ImmediatePrompt {
    fn interact(&mut self, _ctx: &PromptContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Keeps the session up for a fixed time, or until `shutdown` is raised.
#[derive(Debug)]
pub struct TimedPrompt {
    pub duration: Duration,
    pub shutdown: Arc<AtomicBool>,
    pub poll_interval: Duration,
}

impl TimedPrompt {
    pub fn new(duration: Duration, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            duration,
            shutdown,
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl OperatorPrompt for TimedPrompt {
    fn interact(&mut self, _ctx: &PromptContext<'_>) -> Result<()> {
        tracing::info!(duration_s = self.duration.as_secs_f64(), "running unattended");
        let deadline = Instant::now() + self.duration;
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                tracing::info!("interrupted, leaving session");
                return Ok(());
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(());
            }
            std::thread::sleep(self.poll_interval.min(left));
        }
    }
}
