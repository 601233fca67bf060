//! Git plumbing for repository-backed sources.

pub mod auth;
pub mod parse;
pub mod repository;

pub use repository::GitRepository;
