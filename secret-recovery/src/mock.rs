// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! In-memory secret recovery service for tests.
//!
//! Without scripted responses the mock behaves like a well-behaved server: every
//! store issues a fresh token and metadata header, and restore returns the token
//! for a metadata header it issued. Errors can be queued per call kind; queued
//! entries are consumed before the default behavior applies.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::{
    Result,
    error::SvrError,
    service::SecretRecoveryService,
    types::{RestoreRequest, RestoreResponse, StoreRequest, StoreResponse, SvrCredential},
};

#[derive(Debug, Default)]
struct MockState {
    credential_errors: VecDeque<SvrError>,
    store_errors: VecDeque<SvrError>,
    restore_errors: VecDeque<SvrError>,
    credential_calls: Vec<bool>,
    store_calls: Vec<StoreRequest>,
    restore_calls: Vec<RestoreRequest>,
    // metadata header -> token
    issued: HashMap<Vec<u8>, Vec<u8>>,
    counter: u8,
}

#[derive(Debug, Default)]
pub struct MockSecretRecovery {
    state: Mutex<MockState>,
}

impl MockSecretRecovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error for the next credential call.
    pub fn push_credential_error(&self, err: SvrError) {
        self.state.lock().credential_errors.push_back(err);
    }

    /// Queue an error for the next store call.
    pub fn push_store_error(&self, err: SvrError) {
        self.state.lock().store_errors.push_back(err);
    }

    /// Queue an error for the next restore call.
    pub fn push_restore_error(&self, err: SvrError) {
        self.state.lock().restore_errors.push_back(err);
    }

    /// `force_refresh` flag of every credential call, in order.
    pub fn credential_calls(&self) -> Vec<bool> {
        self.state.lock().credential_calls.clone()
    }

    pub fn store_calls(&self) -> Vec<StoreRequest> {
        self.state.lock().store_calls.clone()
    }

    pub fn restore_calls(&self) -> Vec<RestoreRequest> {
        self.state.lock().restore_calls.clone()
    }

    /// Forget every issued token, so restore answers `NotFound`.
    pub fn forget_chain(&self) {
        self.state.lock().issued.clear();
    }
}

impl SecretRecoveryService for MockSecretRecovery {
    async fn credential(&self, force_refresh: bool) -> Result<SvrCredential> {
        let mut state = self.state.lock();
        state.credential_calls.push(force_refresh);
        if let Some(err) = state.credential_errors.pop_front() {
            return Err(err);
        }
        let n = state.credential_calls.len();
        Ok(SvrCredential::new(format!("mock-user-{n}"), "mock-password"))
    }

    async fn store(&self, _credential: &SvrCredential, request: StoreRequest) -> Result<StoreResponse> {
        let mut state = self.state.lock();
        state.store_calls.push(request);
        if let Some(err) = state.store_errors.pop_front() {
            return Err(err);
        }
        state.counter = state.counter.wrapping_add(1);
        let n = state.counter;
        let token = vec![n; 32];
        let metadata = format!("mock-metadata-{n}").into_bytes();
        state.issued.insert(metadata.clone(), token.clone());
        Ok(StoreResponse {
            forward_secrecy_token: token,
            next_secret_data: format!("mock-next-secret-{n}").into_bytes(),
            metadata,
        })
    }

    async fn restore(
        &self,
        _credential: &SvrCredential,
        request: RestoreRequest,
    ) -> Result<RestoreResponse> {
        let mut state = self.state.lock();
        let metadata = request.metadata.clone();
        state.restore_calls.push(request);
        if let Some(err) = state.restore_errors.pop_front() {
            return Err(err);
        }
        let token = state.issued.get(&metadata).cloned().ok_or(SvrError::NotFound)?;
        state.counter = state.counter.wrapping_add(1);
        Ok(RestoreResponse {
            forward_secrecy_token: token,
            next_secret_data: format!("mock-next-secret-{}", state.counter).into_bytes(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_request() -> StoreRequest {
        StoreRequest {
            backup_id: vec![7; 16],
            password: vec![1; 32],
            previous_secret_data: None,
        }
    }

    #[test_log::test(tokio::test)]
    async fn store_then_restore_returns_same_token() {
        let mock = MockSecretRecovery::new();
        let cred = mock.credential(false).await.expect("cred");
        let stored = mock.store(&cred, store_request()).await.expect("store");
        let restored = mock
            .restore(
                &cred,
                RestoreRequest {
                    backup_id: vec![7; 16],
                    password: vec![1; 32],
                    metadata: stored.metadata.clone(),
                },
            )
            .await
            .expect("restore");
        assert_eq!(restored.forward_secrecy_token, stored.forward_secrecy_token);
        assert_ne!(restored.next_secret_data, stored.next_secret_data);
    }

    #[test_log::test(tokio::test)]
    async fn queued_errors_are_consumed_in_order() {
        let mock = MockSecretRecovery::new();
        mock.push_store_error(SvrError::NotFound);
        let cred = mock.credential(true).await.expect("cred");
        assert!(matches!(
            mock.store(&cred, store_request()).await,
            Err(SvrError::NotFound)
        ));
        assert!(mock.store(&cred, store_request()).await.is_ok());
        assert_eq!(mock.store_calls().len(), 2);
        assert_eq!(mock.credential_calls(), vec![true]);
    }
}
