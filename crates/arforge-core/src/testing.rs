//! Scripted backend shared by unit tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{BackendJob, BackendOp, ConversionBackend};
use crate::error::PipelineError;

/// Writes a deterministic artifact derived from its input.
///
/// Simplify keeps `1 - reduction` of the input bytes, Draco keeps half,
/// exports copy the input.
pub(crate) struct FakeBackend {
    name: String,
    fail_first: u32,
    failure: PipelineError,
    write_nothing: bool,
    available: bool,
    delay: Option<Duration>,
    calls: AtomicU32,
    ops: Mutex<Vec<BackendOp>>,
}

impl FakeBackend {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            fail_first: 0,
            failure: PipelineError::backend(name, "scripted failure"),
            write_nothing: false,
            available: true,
            delay: None,
            calls: AtomicU32::new(0),
            ops: Mutex::new(Vec::new()),
        }
    }

    /// Fail the first `n` runs with `error`.
    pub(crate) fn failing(mut self, n: u32, error: PipelineError) -> Self {
        self.fail_first = n;
        self.failure = error;
        self
    }

    pub(crate) fn writing_nothing(mut self) -> Self {
        self.write_nothing = true;
        self
    }

    pub(crate) fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub(crate) fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn ops(&self) -> Vec<BackendOp> {
        self.ops.lock().map(|ops| ops.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ConversionBackend for FakeBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn run(&self, job: &BackendJob) -> Result<(), PipelineError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut ops) = self.ops.lock() {
            ops.push(job.op.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if call <= self.fail_first {
            return Err(self.failure.clone());
        }
        if self.write_nothing {
            return Ok(());
        }
        let input = tokio::fs::read(&job.input).await?;
        let keep = match &job.op {
            BackendOp::Simplify { reduction } => {
                ((input.len() as f64) * (1.0 - reduction)).ceil() as usize
            }
            BackendOp::DracoEncode(_) => input.len().div_ceil(2),
            _ => input.len(),
        };
        tokio::fs::write(&job.output, &input[..keep.min(input.len())]).await?;
        Ok(())
    }
}
