// Domain layer - Core transcoding types and rules

pub mod errors;
pub mod model;
pub mod presets;
pub mod rules;
