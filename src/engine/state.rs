//! Pipeline state machine

use std::fmt;

use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{TranscodeError, TranscodeResult};

/// Lifecycle state of one transcode job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    DetectingFormat,
    Configuring,
    Transcoding,
    Draining,
    Finalizing,
    Done,
    Aborted,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Aborted | PipelineState::Failed)
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Aborted | Failed) {
            return true;
        }
        matches!(
            (self, next),
            (Idle, DetectingFormat)
                | (DetectingFormat, Configuring)
                | (Configuring, Transcoding)
                | (Transcoding, Draining)
                | (Draining, Finalizing)
                | (Finalizing, Done)
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::DetectingFormat => "detecting_format",
            PipelineState::Configuring => "configuring",
            PipelineState::Transcoding => "transcoding",
            PipelineState::Draining => "draining",
            PipelineState::Finalizing => "finalizing",
            PipelineState::Done => "done",
            PipelineState::Aborted => "aborted",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Snapshot taken when a transition happens
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    pub from: PipelineState,
    pub to: PipelineState,
    pub video_chunks_muxed: u64,
    pub audio_chunks_muxed: u64,
}

/// Enforces the transition graph and publishes the current state
pub struct StateMachine {
    current: PipelineState,
    history: Vec<StateTransition>,
    publisher: watch::Sender<PipelineState>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (publisher, _) = watch::channel(PipelineState::Idle);
        Self {
            current: PipelineState::Idle,
            history: Vec::new(),
            publisher,
        }
    }

    pub fn current(&self) -> PipelineState {
        self.current
    }

    /// Receiver observing every state change
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.publisher.subscribe()
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    /// Move to `next`, recording the muxed chunk counts at that moment
    pub fn transition(&mut self, next: PipelineState, muxed: (u64, u64)) -> TranscodeResult<()> {
        if !self.current.can_transition_to(next) {
            return Err(TranscodeError::IllegalTransition {
                from: self.current.to_string(),
                to: next.to_string(),
            });
        }
        debug!("Pipeline state {} -> {}", self.current, next);
        self.history.push(StateTransition {
            from: self.current,
            to: next,
            video_chunks_muxed: muxed.0,
            audio_chunks_muxed: muxed.1,
        });
        self.current = next;
        self.publisher.send_replace(next);
        Ok(())
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
