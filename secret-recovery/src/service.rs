// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! The secret recovery service contract.

use std::{future::Future, sync::Arc};

use crate::{
    Result,
    types::{RestoreRequest, RestoreResponse, StoreRequest, StoreResponse, SvrCredential},
};

/// Remote service that stores and restores forward-secrecy tokens.
///
/// Implementations make exactly one attempt per call. Retry policy (connection
/// retries, rate-limit waits, chain restarts) belongs to the caller.
pub trait SecretRecoveryService: Send + Sync {
    /// Returns a service credential. With `force_refresh` any cached credential is
    /// discarded and a new one is fetched.
    fn credential(&self, force_refresh: bool) -> impl Future<Output = Result<SvrCredential>> + Send;

    /// Advance the secret chain and obtain a token for a new backup.
    fn store(
        &self,
        credential: &SvrCredential,
        request: StoreRequest,
    ) -> impl Future<Output = Result<StoreResponse>> + Send;

    /// Recover the token for an existing backup from its metadata header.
    fn restore(
        &self,
        credential: &SvrCredential,
        request: RestoreRequest,
    ) -> impl Future<Output = Result<RestoreResponse>> + Send;
}

impl<T: SecretRecoveryService> SecretRecoveryService for Arc<T> {
    fn credential(&self, force_refresh: bool) -> impl Future<Output = Result<SvrCredential>> + Send {
        self.as_ref().credential(force_refresh)
    }

    fn store(
        &self,
        credential: &SvrCredential,
        request: StoreRequest,
    ) -> impl Future<Output = Result<StoreResponse>> + Send {
        self.as_ref().store(credential, request)
    }

    fn restore(
        &self,
        credential: &SvrCredential,
        request: RestoreRequest,
    ) -> impl Future<Output = Result<RestoreResponse>> + Send {
        self.as_ref().restore(credential, request)
    }
}
