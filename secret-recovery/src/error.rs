// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Errors returned by the secret recovery service
//!
use std::time::Duration;

use snafu::prelude::*;

/// Errors returned by [`SecretRecoveryService`](crate::SecretRecoveryService) calls.
///
/// The set is closed: callers decide their retry policy by matching on
/// `InvalidArgument`, `NotFound`, `RateLimited` and `Connection`; every other
/// variant is treated as a generic failure.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SvrError {
    /// The request was rejected as malformed. For store requests this usually means
    /// the previous secret data no longer matches the server's chain state.
    #[snafu(display("invalid argument: {message}"))]
    InvalidArgument { message: String },

    /// The server has no chain state for this backup id.
    #[snafu(display("secret chain not found"))]
    NotFound,

    /// Server asked us to slow down.
    #[snafu(display("rate limited, retry after {}s", retry_after.as_secs()))]
    RateLimited { retry_after: Duration },

    /// Connection failure or timeout. Safe to retry with a fresh credential.
    #[snafu(display("connection error {url}: {message}"))]
    Connection { url: String, message: String },

    /// Http error that is not connection related (invalid url, TLS failure, body read).
    #[snafu(display("HTTP error {method} url:{url}"))]
    Http {
        method: String,
        url: String,
        source: reqwest::Error,
    },

    /// Server responded with an unexpected status.
    #[snafu(display("server reported error ({code}) {url}: {message}"))]
    Api {
        code: u16,
        url: String,
        message: String,
    },

    /// Account credentials for the credential endpoint were never configured.
    #[snafu(display("account credentials not set"))]
    Unauthenticated,

    /// Deserialization error. The server response didn't match the expected shape.
    #[snafu(display("Deserialization: {source}"))]
    Deserialization { source: serde_json::Error },

    /// Serialization error. unlikely to occur.
    #[snafu(display("Serialization: {source}"))]
    Serialization { source: serde_json::Error },

    /// Some other error occurred
    #[snafu(display("{message}"))]
    Other { message: String },
}

impl SvrError {
    /// True for failures worth an automatic retry with a refreshed credential.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}
