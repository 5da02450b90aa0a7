// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Slot session pooling.
//!
//! A [`SlotSessionPool`] bounds the number of concurrently open sessions
//! against one physical or logical slot. Signing operations run concurrently
//! up to the session limit; administrative operations (key generation, object
//! deletion, certificate updates) take the whole slot exclusively so they
//! cannot race with in-flight signing on the same token.
//!
//! Token operations are synchronous: PKCS#11 and comparable interfaces block,
//! and wrapping each call in a threadpool hop buys nothing when the pool
//! already bounds concurrency. The pool itself is async so callers can wait
//! for a session without holding a thread.

use crate::error::{CaError, Result};
use crate::signing::{KeyHandle, KeySpec, SigningIdentity};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, warn};
use x509_cert::Certificate;

use super::Mechanism;

/// Errors reported by token sessions.
///
/// `AuthenticationLost` is the one condition the pool handles itself: it
/// re-authenticates the session once and retries the single failed operation
/// exactly once before surfacing the error.
#[derive(Debug)]
pub enum SessionError {
    /// The token reports the session is no longer authenticated.
    AuthenticationLost,
    /// Any other token-level failure.
    Token(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AuthenticationLost => write!(f, "session authentication lost"),
            Self::Token(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl SessionError {
    /// Create a token error with the given message.
    pub fn token(msg: impl Into<String>) -> Self {
        Self::Token(msg.into())
    }
}

/// An authenticated session against one slot.
///
/// Sessions are owned by the pool; callers only ever see a `&mut` borrow
/// inside [`SlotSessionPool::with_session`].
pub trait TokenSession: Send {
    /// Sign `content` with the key identified by `key`.
    fn sign(
        &mut self,
        key: &KeyHandle,
        mechanism: Mechanism,
        parameters: Option<&[u8]>,
        content: &[u8],
    ) -> std::result::Result<Vec<u8>, SessionError>;

    /// Digest a token-resident secret key without exporting it.
    fn digest_secret_key(
        &mut self,
        key: &KeyHandle,
        mechanism: Mechanism,
    ) -> std::result::Result<Vec<u8>, SessionError>;

    /// Re-authenticate this session after an authentication-lost condition.
    fn login(&mut self) -> std::result::Result<(), SessionError>;
}

/// A physical or logical slot that can open sessions and manage key objects.
///
/// Administrative operations are defined here rather than on
/// [`TokenSession`] because they require exclusive slot access; the pool
/// enforces that exclusivity before delegating.
pub trait SlotToken: Send + Sync {
    /// Open a new authenticated session.
    fn open_session(&self) -> std::result::Result<Box<dyn TokenSession>, SessionError>;

    /// Generate a key pair on the token and return its signing identity.
    fn generate_keypair(&self, spec: &KeySpec) -> std::result::Result<SigningIdentity, SessionError>;

    /// Destroy the key objects behind `handle`.
    fn remove_identity(&self, handle: &KeyHandle) -> std::result::Result<(), SessionError>;

    /// Install or replace the certificate chain stored with `handle`.
    fn update_certificate(
        &self,
        handle: &KeyHandle,
        chain: &[Certificate],
    ) -> std::result::Result<(), SessionError>;

    /// Cheap slot liveness probe (token info lookup or equivalent).
    fn probe(&self) -> std::result::Result<(), SessionError>;
}

/// Bounded pool of sessions against one slot.
pub struct SlotSessionPool {
    token: Box<dyn SlotToken>,
    permits: Semaphore,
    max_sessions: usize,
    acquire_timeout: Duration,
    idle: Mutex<Vec<Box<dyn TokenSession>>>,
}

impl SlotSessionPool {
    /// Create a pool over `token` with at most `max_sessions` concurrent
    /// sessions and the given acquisition timeout.
    pub fn new(
        token: Box<dyn SlotToken>,
        max_sessions: usize,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        if max_sessions == 0 {
            return Err(CaError::configuration(
                "slot session pool requires max_sessions >= 1",
            ));
        }
        Ok(Self {
            token,
            permits: Semaphore::new(max_sessions),
            max_sessions,
            acquire_timeout,
            idle: Mutex::new(Vec::new()),
        })
    }

    /// Run `op` with a session, waiting up to the acquire timeout for one to
    /// become available.
    ///
    /// The session is released on every exit path. If the operation reports
    /// [`SessionError::AuthenticationLost`], the pool re-authenticates the
    /// session and retries `op` once; a second failure surfaces to the
    /// caller. Sessions that report other token errors are discarded rather
    /// than returned to the idle set.
    pub async fn with_session<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(&mut dyn TokenSession) -> std::result::Result<T, SessionError> + Send,
        T: Send,
    {
        let started = Instant::now();
        let permit = timeout(self.acquire_timeout, self.permits.acquire())
            .await
            .map_err(|_| CaError::SessionPoolExhausted {
                waited_ms: started.elapsed().as_millis() as u64,
            })?
            .map_err(|_| CaError::signing("session pool is shut down"))?;

        let mut session = self.checkout()?;

        let result = match op(session.as_mut()) {
            Err(SessionError::AuthenticationLost) => {
                warn!("token session lost authentication, re-authenticating once");
                match session.login() {
                    Ok(()) => op(session.as_mut()),
                    Err(e) => Err(e),
                }
            }
            other => other,
        };

        // The session must be back in the idle set (or dropped) before the
        // permit frees a waiter; otherwise that waiter opens a fresh session
        // and the pool transiently exceeds max_sessions.
        let outcome = match result {
            Ok(value) => {
                self.checkin(session);
                Ok(value)
            }
            Err(SessionError::AuthenticationLost) => {
                drop(session);
                Err(CaError::signing(
                    "session authentication lost and re-login did not recover",
                ))
            }
            Err(SessionError::Token(msg)) => {
                drop(session);
                Err(CaError::signing(msg))
            }
        };
        drop(permit);
        outcome
    }

    /// Generate a key pair with exclusive slot access.
    pub async fn generate_keypair(&self, spec: &KeySpec) -> Result<SigningIdentity> {
        let _exclusive = self.acquire_exclusive().await?;
        debug!(algorithm = spec.algorithm.as_str(), "generating key pair");
        self.token
            .generate_keypair(spec)
            .map_err(Self::admin_error)
    }

    /// Destroy the key objects behind `handle`, with exclusive slot access.
    pub async fn remove_identity(&self, handle: &KeyHandle) -> Result<()> {
        let _exclusive = self.acquire_exclusive().await?;
        self.token.remove_identity(handle).map_err(Self::admin_error)
    }

    /// Install or replace the certificate chain stored with `handle`, with
    /// exclusive slot access.
    pub async fn update_certificate(
        &self,
        handle: &KeyHandle,
        chain: &[Certificate],
    ) -> Result<()> {
        let _exclusive = self.acquire_exclusive().await?;
        self.token
            .update_certificate(handle, chain)
            .map_err(Self::admin_error)
    }

    /// Cheap slot liveness probe; does not consume a session.
    pub fn probe(&self) -> Result<()> {
        self.token
            .probe()
            .map_err(|e| CaError::signing(format!("slot probe failed: {e}")))
    }

    /// Number of sessions this pool will open at most.
    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    fn checkout(&self) -> Result<Box<dyn TokenSession>> {
        let reused = self.idle.lock().expect("idle set poisoned").pop();
        match reused {
            Some(session) => Ok(session),
            None => self
                .token
                .open_session()
                .map_err(|e| CaError::signing(format!("failed to open session: {e}"))),
        }
    }

    fn checkin(&self, session: Box<dyn TokenSession>) {
        self.idle.lock().expect("idle set poisoned").push(session);
    }

    async fn acquire_exclusive(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        let started = Instant::now();
        timeout(
            self.acquire_timeout,
            self.permits.acquire_many(self.max_sessions as u32),
        )
        .await
        .map_err(|_| CaError::SessionPoolExhausted {
            waited_ms: started.elapsed().as_millis() as u64,
        })?
        .map_err(|_| CaError::signing("session pool is shut down"))
    }

    fn admin_error(err: SessionError) -> CaError {
        CaError::signing(format!("slot administrative operation failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::KeyAlgorithm;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FlakySession {
        fail_next: bool,
        logins: Arc<AtomicUsize>,
    }

    impl TokenSession for FlakySession {
        fn sign(
            &mut self,
            _key: &KeyHandle,
            _mechanism: Mechanism,
            _parameters: Option<&[u8]>,
            _content: &[u8],
        ) -> std::result::Result<Vec<u8>, SessionError> {
            if self.fail_next {
                self.fail_next = false;
                return Err(SessionError::AuthenticationLost);
            }
            Ok(vec![0xab; 64])
        }

        fn digest_secret_key(
            &mut self,
            _key: &KeyHandle,
            _mechanism: Mechanism,
        ) -> std::result::Result<Vec<u8>, SessionError> {
            Ok(vec![0x01; 32])
        }

        fn login(&mut self) -> std::result::Result<(), SessionError> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FlakyToken {
        fail_first_sign: bool,
        opened: Arc<AtomicUsize>,
        logins: Arc<AtomicUsize>,
    }

    impl SlotToken for FlakyToken {
        fn open_session(&self) -> std::result::Result<Box<dyn TokenSession>, SessionError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FlakySession {
                fail_next: self.fail_first_sign,
                logins: self.logins.clone(),
            }))
        }

        fn generate_keypair(
            &self,
            spec: &KeySpec,
        ) -> std::result::Result<SigningIdentity, SessionError> {
            Err(SessionError::token(format!(
                "keygen unsupported for {}",
                spec.algorithm.as_str()
            )))
        }

        fn remove_identity(&self, _handle: &KeyHandle) -> std::result::Result<(), SessionError> {
            Ok(())
        }

        fn update_certificate(
            &self,
            _handle: &KeyHandle,
            _chain: &[Certificate],
        ) -> std::result::Result<(), SessionError> {
            Ok(())
        }

        fn probe(&self) -> std::result::Result<(), SessionError> {
            Ok(())
        }
    }

    fn test_handle() -> KeyHandle {
        KeyHandle::new(vec![1], KeyAlgorithm::EcdsaP256, None)
    }

    #[tokio::test]
    async fn test_sessions_are_reused() {
        let opened = Arc::new(AtomicUsize::new(0));
        let pool = SlotSessionPool::new(
            Box::new(FlakyToken {
                fail_first_sign: false,
                opened: opened.clone(),
                logins: Arc::new(AtomicUsize::new(0)),
            }),
            2,
            Duration::from_millis(100),
        )
        .unwrap();

        let handle = test_handle();
        for _ in 0..5 {
            pool.with_session(|s| s.sign(&handle, Mechanism::EcdsaSha256, None, b"x"))
                .await
                .unwrap();
        }
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auth_lost_triggers_single_relogin_and_retry() {
        let logins = Arc::new(AtomicUsize::new(0));
        let pool = SlotSessionPool::new(
            Box::new(FlakyToken {
                fail_first_sign: true,
                opened: Arc::new(AtomicUsize::new(0)),
                logins: logins.clone(),
            }),
            1,
            Duration::from_millis(100),
        )
        .unwrap();

        let handle = test_handle();
        let sig = pool
            .with_session(|s| s.sign(&handle, Mechanism::EcdsaSha256, None, b"x"))
            .await
            .unwrap();
        assert_eq!(sig.len(), 64);
        assert_eq!(logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_saturated_pool_times_out() {
        let pool = Arc::new(
            SlotSessionPool::new(
                Box::new(FlakyToken {
                    fail_first_sign: false,
                    opened: Arc::new(AtomicUsize::new(0)),
                    logins: Arc::new(AtomicUsize::new(0)),
                }),
                1,
                Duration::from_millis(50),
            )
            .unwrap(),
        );

        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let holder = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let handle = test_handle();
                pool.with_session(move |s| {
                    // Hold the only session until the test releases it.
                    release_rx.recv().ok();
                    s.sign(&handle, Mechanism::EcdsaSha256, None, b"x")
                })
                .await
            })
        };

        // Give the holder time to take the session.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let handle = test_handle();
        let err = pool
            .with_session(|s| s.sign(&handle, Mechanism::EcdsaSha256, None, b"y"))
            .await
            .unwrap_err();
        assert!(matches!(err, CaError::SessionPoolExhausted { .. }));

        release_tx.send(()).unwrap();
        holder.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_admin_ops_wait_for_in_flight_signing() {
        let pool = Arc::new(
            SlotSessionPool::new(
                Box::new(FlakyToken {
                    fail_first_sign: false,
                    opened: Arc::new(AtomicUsize::new(0)),
                    logins: Arc::new(AtomicUsize::new(0)),
                }),
                1,
                Duration::from_millis(50),
            )
            .unwrap(),
        );

        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let holder = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let handle = test_handle();
                pool.with_session(move |s| {
                    release_rx.recv().ok();
                    s.sign(&handle, Mechanism::EcdsaSha256, None, b"x")
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Exclusive admin access cannot be granted while a session is out.
        let err = pool
            .update_certificate(&test_handle(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, CaError::SessionPoolExhausted { .. }));

        release_tx.send(()).unwrap();
        holder.await.unwrap().unwrap();

        // With the slot quiet, admin operations go through.
        pool.update_certificate(&test_handle(), &[]).await.unwrap();
        pool.remove_identity(&test_handle()).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_open_sessions_never_exceed_limit() {
        let opened = Arc::new(AtomicUsize::new(0));
        let pool = Arc::new(
            SlotSessionPool::new(
                Box::new(FlakyToken {
                    fail_first_sign: false,
                    opened: opened.clone(),
                    logins: Arc::new(AtomicUsize::new(0)),
                }),
                2,
                Duration::from_secs(5),
            )
            .unwrap(),
        );

        // Hammer the pool from more tasks than sessions. Every released
        // session must be visible to the next acquirer, so the token is
        // never asked for more than max_sessions sessions in total.
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let handle = test_handle();
                for _ in 0..10 {
                    pool.with_session(|s| {
                        std::thread::sleep(Duration::from_millis(1));
                        s.sign(&handle, Mechanism::EcdsaSha256, None, b"x")
                    })
                    .await
                    .unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(opened.load(Ordering::SeqCst) <= pool.max_sessions());
        assert!(pool.idle.lock().unwrap().len() <= pool.max_sessions());
    }

    #[tokio::test]
    async fn test_zero_sessions_rejected() {
        let err = SlotSessionPool::new(
            Box::new(FlakyToken {
                fail_first_sign: false,
                opened: Arc::new(AtomicUsize::new(0)),
                logins: Arc::new(AtomicUsize::new(0)),
            }),
            0,
            Duration::from_millis(50),
        )
        .err()
        .unwrap();
        assert!(matches!(err, CaError::Configuration(_)));
    }
}
