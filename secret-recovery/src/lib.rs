/*
 * secret-recovery - forward secrecy token service client
 *
 * SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
 * SPDX-License-Identifier: Apache-2.0
 */
//! # Secret Recovery Service Client
//!
//! Encrypted backups derive their archive key from a long-term backup key and a
//! short-lived *forward secrecy token*. Tokens are held by a remote secret recovery
//! service that keeps a chain of secrets per backup id: each `store` advances the
//! chain and returns a new token, the *next secret data* to present on the following
//! store, and a metadata blob that is prepended to the archive. `restore` recovers the
//! token from that metadata blob.
//!
//! This crate provides
//!
//! - the [`SecretRecoveryService`] contract with a closed error set ([`SvrError`])
//! - [`HttpSecretRecoveryClient`], an https implementation with credential caching and metrics
//! - [`mock::MockSecretRecovery`], a scriptable in-memory implementation for tests
//!
//! ```rust,no_run
//! use secret_recovery::prelude::*;
//! # async fn example() -> Result<(), SvrError> {
//! let client = HttpSecretRecoveryClient::with_config(
//!     SvrClientConfig::default().base_url("https://svr.example.org"),
//! )?;
//! client.set_account(AccountCredentials {
//!     username: "account".into(),
//!     password: "secret".into(),
//! });
//! let credential = client.credential(false).await?;
//! let response = client
//!     .store(&credential, StoreRequest {
//!         backup_id: vec![0; 16],
//!         password: vec![0; 32],
//!         previous_secret_data: None,
//!     })
//!     .await?;
//! println!("metadata {} bytes", response.metadata.len());
//! # Ok(())
//! # }
//! ```
//!
#![allow(clippy::missing_errors_doc)] // pedantic
#![allow(clippy::missing_const_for_fn)] //  nursery function
#![allow(clippy::must_use_candidate)] // pedantic
#![warn(clippy::default_trait_access)]
#![warn(clippy::doc_markdown)]
#![warn(clippy::explicit_iter_loop)]
#![warn(clippy::implicit_clone)]
#![warn(clippy::match_same_arms)]
#![warn(clippy::redundant_clone)]
#![warn(clippy::redundant_closure)]
#![warn(clippy::uninlined_format_args)]
#![warn(clippy::unused_async)]

pub mod error;
pub mod http_client;
#[doc(hidden)]
pub mod mock;
pub mod service;
pub mod types;

pub use error::SvrError;
pub use http_client::{HttpSecretRecoveryClient, SvrClientConfig, SvrMetricsSnapshot};
pub use service::SecretRecoveryService;

/// Result type alias using `SvrError` as the default error.
pub type Result<T, E = crate::error::SvrError> = std::result::Result<T, E>;

/// Prelude module - import the service trait, client and types with `use secret_recovery::prelude::*;`
pub mod prelude {
    pub use crate::error::*;
    pub use crate::{
        http_client::{HttpSecretRecoveryClient, SvrClientConfig, SvrMetricsSnapshot},
        service::SecretRecoveryService,
        types::{
            AccountCredentials, RestoreRequest, RestoreResponse, StoreRequest, StoreResponse,
            SvrCredential,
        },
    };
}

// ============================================================================
// CONSTANTS
// ============================================================================

/// Default service endpoint
pub const DEFAULT_SVR_URL: &str = "https://svr.backup.invalid";

pub(crate) mod config {
    pub use super::DEFAULT_SVR_URL;

    /// Environment variable for the service endpoint URL
    pub const SVR_URL_ENV: &str = "BACKUP_SVR_URL";

    /// Credential endpoint (account basic auth)
    pub const CREDENTIAL_PATH: &str = "/v1/backup/auth/svr";

    /// Forward secrecy chain store endpoint
    pub const STORE_PATH: &str = "/v1/backup/forward-secrecy/store";

    /// Forward secrecy chain restore endpoint
    pub const RESTORE_PATH: &str = "/v1/backup/forward-secrecy/restore";

    pub const REQUEST_TIMEOUT_SECS: u64 = 30;
    pub const CONNECT_TIMEOUT_SECS: u64 = 10;
}
