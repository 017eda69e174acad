// Durable space store client.
//
// REST surface:
//   GET    /spaces/:id
//   PUT    /spaces/:id                      {windows, settings}
//   PATCH  /spaces/:id                      {name}
//   POST   /spaces/:id/permissions          {userId, role}
//   DELETE /spaces/:id/permissions/:userId
//
// Abstracted via `SpaceBackend` so the store and reconciler run against the
// HTTP client or the in-memory backend (offline mode, simulator, tests).

pub mod http;
pub mod memory;

use std::future::Future;

use thiserror::Error;

use deskspace_common::types::{SpaceMember, SpaceRecord, SpaceSnapshot};

pub use http::HttpBackend;
pub use memory::MemoryBackend;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("space `{0}` not found")]
    NotFound(String),
    /// 5xx, timeouts, connection failures. Safe to retry.
    #[error("transient backend failure: {0}")]
    Transient(String),
    /// Any other non-success status. Not retried.
    #[error("backend rejected request with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("invalid backend response: {0}")]
    Decode(String),
    #[error("invalid backend configuration: {0}")]
    Config(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(space_id: &str, status: u16, message: impl Into<String>) -> Self {
        match status {
            404 => Self::NotFound(space_id.to_string()),
            408 | 429 | 500..=599 => Self::Transient(format!("status {status}: {}", message.into())),
            _ => Self::Rejected { status, message: message.into() },
        }
    }
}

pub trait SpaceBackend: Send + Sync + 'static {
    fn get_space(&self, space_id: &str) -> impl Future<Output = Result<SpaceRecord, BackendError>> + Send;

    fn put_space(
        &self,
        space_id: &str,
        snapshot: &SpaceSnapshot,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    fn rename_space(&self, space_id: &str, name: &str) -> impl Future<Output = Result<(), BackendError>> + Send;

    fn grant_permission(
        &self,
        space_id: &str,
        member: &SpaceMember,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    fn revoke_permission(
        &self,
        space_id: &str,
        user_id: &str,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;
}
