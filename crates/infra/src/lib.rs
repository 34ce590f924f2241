//! Infrastructure layer: job system, stores, config, external services.

pub mod config;
pub mod external;
pub mod jobs;
pub mod pipeline;
