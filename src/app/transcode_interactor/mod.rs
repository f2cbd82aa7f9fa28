// Transcode interactor - Runs one pipeline job with cancellation wiring

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::model::OutputSpec;
use crate::engine::{PipelineController, PipelineIo, PipelineState, PipelineTuning, TranscodeReport};
use crate::error::TranscodeResult;

/// Interactor for the transcode use case
pub struct TranscodeInteractor {
    tuning: PipelineTuning,
    spec: OutputSpec,
    cancel: CancellationToken,
}

impl TranscodeInteractor {
    /// Create new transcode interactor
    pub fn new(tuning: PipelineTuning, spec: OutputSpec) -> Self {
        Self {
            tuning,
            spec,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that aborts the job when cancelled
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the job on Ctrl-C. The listener stops when the job finishes.
    pub fn cancel_on_ctrl_c(&self) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                signal = tokio::signal::ctrl_c() => match signal {
                    Ok(()) => {
                        warn!("Interrupt received, cancelling transcode");
                        cancel.cancel();
                    }
                    Err(e) => warn!("Unable to listen for Ctrl-C: {}", e),
                },
            }
        });
    }

    /// Run the job against `io`
    pub async fn execute(&self, io: PipelineIo) -> TranscodeResult<TranscodeReport> {
        self.execute_observed(io, |_| {}).await
    }

    /// Run the job, handing the state receiver to `observe` before it starts
    pub async fn execute_observed<F>(&self, io: PipelineIo, observe: F) -> TranscodeResult<TranscodeReport>
    where
        F: FnOnce(watch::Receiver<PipelineState>),
    {
        let controller = PipelineController::new(
            self.tuning.clone(),
            self.spec.clone(),
            io,
            self.cancel.clone(),
        )?;
        observe(controller.subscribe_state());
        info!("Starting transcode job");
        let result = controller.run().await;
        // Stops the Ctrl-C listener
        self.cancel.cancel();
        result
    }
}
