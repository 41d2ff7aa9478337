//! Directory backend capability.
//!
//! The gateway is backend-agnostic: any implementer of
//! [`DirectoryBackend`] satisfies the same contract. The production
//! implementation lives in [`crate::ldap`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors a directory backend can surface.
///
/// `BackendUnavailable` is retryable; `PermissionDenied` and `NotFound`
/// are final and must never be retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("account not found on directory")]
    NotFound,
    #[error("directory refused the operation")]
    PermissionDenied,
    #[error("directory backend unavailable")]
    BackendUnavailable,
}

/// A projection of backend state, fetched on demand and never cached
/// beyond a single request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryUser {
    /// Unique, stable account identifier (`sAMAccountName`).
    pub account_id: String,
    pub display_name: String,
    pub principal_name: String,
    pub enabled: bool,
    pub groups: Vec<String>,
    pub department: Option<String>,
    pub last_logon: Option<String>,
}

/// Scoped directory operations, each executed on a bound connection.
#[async_trait]
pub trait DirectoryBackend: Send + Sync {
    /// Single-result lookup by identifier or fuzzy name match.
    ///
    /// When the backend returns several matches, an exact identifier match
    /// wins over a fuzzy one; otherwise the first result in ascending
    /// identifier order is taken.
    async fn search(&self, query: &str)
        -> Result<DirectoryUser, DirectoryError>;

    /// Set or clear the account-disabled flag.
    ///
    /// Idempotent: asking for a state the account is already in succeeds
    /// without issuing a backend mutation.
    async fn modify_account_flag(
        &self,
        account_id: &str,
        enabled: bool,
    ) -> Result<(), DirectoryError>;

    /// Replace the account's credential.
    async fn reset_credential(
        &self,
        account_id: &str,
        new_password: &str,
    ) -> Result<(), DirectoryError>;
}
