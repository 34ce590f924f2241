//! `commitpulse-core`: shared primitives for the commit processing pipeline.
//!
//! This crate contains **pure** building blocks (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{AccountId, CommitId, JobId, ProjectId};
