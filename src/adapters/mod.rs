// Adapters - External system implementations

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod fs_sink;
pub mod simulated;
pub mod toml_config;
pub mod tracing_log;

// Re-export adapters
pub use fs_sink::FileDestination;
pub use simulated::{MemoryDestination, SimulatedCodecs, SimulatedDemux, SimulatedMuxFactory};
pub use toml_config::{AppConfig, TomlConfigAdapter};
pub use tracing_log::init_logging;
