// Application layer - Use case interactors

pub mod plan_interactor;
pub mod transcode_interactor;

// Re-export interactors
pub use plan_interactor::{PlanInteractor, TranscodePlan};
pub use transcode_interactor::TranscodeInteractor;
