//! In-memory collaborators for sync tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::error::{AuthError, RemoteError};
use super::remote::{RemoteFileHandle, RemoteStore};
use super::session::AccessToken;
use super::token::{IdentityProvider, IssuedToken, TokenMode};
use crate::models::RecordSet;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Remote store holding files in a map
#[derive(Default)]
pub struct MemoryRemote {
    files: Mutex<BTreeMap<String, (String, Vec<u8>)>>,
    next_id: AtomicUsize,
    latency: Mutex<Option<Duration>>,
    list_error: Mutex<Option<RemoteError>>,
    get_error: Mutex<Option<RemoteError>>,
    create_error: Mutex<Option<RemoteError>>,
    update_error: Mutex<Option<RemoteError>>,
    list_calls: AtomicUsize,
    get_calls: AtomicUsize,
    create_calls: AtomicUsize,
    update_calls: AtomicUsize,
    tokens: Mutex<Vec<String>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_file(&self, id: &str, name: &str, content: &[u8]) {
        lock(&self.files).insert(id.to_string(), (name.to_string(), content.to_vec()));
    }

    pub fn put_records(&self, id: &str, name: &str, records: &RecordSet) {
        let content = records.to_json().unwrap();
        self.put_file(id, name, &content);
    }

    pub fn delete_file(&self, id: &str) {
        lock(&self.files).remove(id);
    }

    pub fn content(&self, id: &str) -> Option<Vec<u8>> {
        lock(&self.files).get(id).map(|(_, content)| content.clone())
    }

    pub fn records(&self, id: &str) -> Option<RecordSet> {
        self.content(id)
            .map(|content| RecordSet::from_json(&content).unwrap())
    }

    pub fn file_ids(&self) -> Vec<String> {
        lock(&self.files).keys().cloned().collect()
    }

    /// Simulated round-trip time for every call
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = Some(latency);
    }

    pub fn fail_lists(&self, err: RemoteError) {
        *lock(&self.list_error) = Some(err);
    }

    pub fn fail_reads(&self, err: RemoteError) {
        *lock(&self.get_error) = Some(err);
    }

    pub fn fail_creates(&self, err: RemoteError) {
        *lock(&self.create_error) = Some(err);
    }

    pub fn fail_updates(&self, err: RemoteError) {
        *lock(&self.update_error) = Some(err);
    }

    pub fn clear_failures(&self) {
        *lock(&self.list_error) = None;
        *lock(&self.get_error) = None;
        *lock(&self.create_error) = None;
        *lock(&self.update_error) = None;
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    /// Number of writes of either kind
    pub fn write_calls(&self) -> usize {
        self.create_calls() + self.update_calls()
    }

    /// Bearer tokens seen, in call order
    pub fn tokens(&self) -> Vec<String> {
        lock(&self.tokens).clone()
    }

    async fn round_trip(&self, token: &str) {
        lock(&self.tokens).push(token.to_string());
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn list_files(
        &self,
        token: &str,
        name: &str,
    ) -> Result<Vec<RemoteFileHandle>, RemoteError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.round_trip(token).await;
        if let Some(err) = lock(&self.list_error).clone() {
            return Err(err);
        }
        Ok(lock(&self.files)
            .iter()
            .filter(|(_, (file_name, _))| file_name == name)
            .map(|(id, (file_name, _))| RemoteFileHandle {
                id: id.clone(),
                name: file_name.clone(),
            })
            .collect())
    }

    async fn get_content(&self, token: &str, file_id: &str) -> Result<Vec<u8>, RemoteError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.round_trip(token).await;
        if let Some(err) = lock(&self.get_error).clone() {
            return Err(err);
        }
        self.content(file_id).ok_or(RemoteError::NotFound)
    }

    async fn create_file(
        &self,
        token: &str,
        name: &str,
        content: Vec<u8>,
    ) -> Result<String, RemoteError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.round_trip(token).await;
        if let Some(err) = lock(&self.create_error).clone() {
            return Err(err);
        }
        let id = format!("file-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.put_file(&id, name, &content);
        Ok(id)
    }

    async fn update_content(
        &self,
        token: &str,
        file_id: &str,
        content: Vec<u8>,
    ) -> Result<(), RemoteError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.round_trip(token).await;
        if let Some(err) = lock(&self.update_error).clone() {
            return Err(err);
        }
        let mut files = lock(&self.files);
        match files.get_mut(file_id) {
            Some((_, existing)) => {
                *existing = content;
                Ok(())
            }
            None => Err(RemoteError::NotFound),
        }
    }
}

/// Identity provider issuing numbered tokens
pub struct FakeIdentity {
    init_error: Mutex<Option<AuthError>>,
    allow_silent: AtomicBool,
    interactive_error: Mutex<Option<AuthError>>,
    lifetime: Mutex<Option<chrono::Duration>>,
    account: Mutex<Option<String>>,
    issued: AtomicUsize,
    requests: Mutex<Vec<(TokenMode, Option<String>)>>,
    revoked: Mutex<Vec<String>>,
    silent_latency: Mutex<Duration>,
    forgotten: AtomicUsize,
}

impl FakeIdentity {
    pub fn new() -> Self {
        Self {
            init_error: Mutex::new(None),
            allow_silent: AtomicBool::new(true),
            interactive_error: Mutex::new(None),
            lifetime: Mutex::new(None),
            account: Mutex::new(Some("me@example.com".to_string())),
            issued: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            revoked: Mutex::new(Vec::new()),
            silent_latency: Mutex::new(Duration::ZERO),
            forgotten: AtomicUsize::new(0),
        }
    }

    pub fn fail_init(&self, err: AuthError) {
        *lock(&self.init_error) = Some(err);
    }

    pub fn set_allow_silent(&self, allow: bool) {
        self.allow_silent.store(allow, Ordering::SeqCst);
    }

    pub fn fail_interactive(&self, err: AuthError) {
        *lock(&self.interactive_error) = Some(err);
    }

    /// Tokens expire this long after issue
    pub fn set_lifetime(&self, lifetime: chrono::Duration) {
        *lock(&self.lifetime) = Some(lifetime);
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<(TokenMode, Option<String>)> {
        lock(&self.requests).clone()
    }

    pub fn revoked(&self) -> Vec<String> {
        lock(&self.revoked).clone()
    }

    /// Silent requests take this long to answer
    pub fn set_silent_latency(&self, latency: Duration) {
        *lock(&self.silent_latency) = latency;
    }

    /// Times the stored credential was dropped
    pub fn forgotten(&self) -> usize {
        self.forgotten.load(Ordering::SeqCst)
    }

    fn issue(&self, hint: Option<String>) -> IssuedToken {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let expires_at = lock(&self.lifetime).map(|lifetime| Utc::now() + lifetime);
        IssuedToken {
            token: AccessToken::new(format!("tok-{}", n), expires_at),
            hint,
        }
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentity {
    async fn init(&self) -> Result<(), AuthError> {
        match lock(&self.init_error).clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn request_token(
        &self,
        mode: TokenMode,
        hint: Option<&str>,
    ) -> Result<IssuedToken, AuthError> {
        lock(&self.requests).push((mode, hint.map(str::to_string)));
        match mode {
            TokenMode::Silent => {
                let latency = *lock(&self.silent_latency);
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                if self.allow_silent.load(Ordering::SeqCst) {
                    Ok(self.issue(None))
                } else {
                    Err(AuthError::InteractionRequired)
                }
            }
            TokenMode::Interactive => {
                if let Some(err) = lock(&self.interactive_error).clone() {
                    return Err(err);
                }
                let account = lock(&self.account).clone();
                Ok(self.issue(account))
            }
        }
    }

    async fn revoke(&self, token: &AccessToken) -> Result<(), AuthError> {
        lock(&self.revoked).push(token.secret().to_string());
        Ok(())
    }

    async fn forget(&self) -> Result<(), AuthError> {
        self.forgotten.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
