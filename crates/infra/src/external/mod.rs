//! External service clients/adapters.

pub mod github;

pub use github::GithubDiffClient;
