//! Bounded pool of browser sessions.
//!
//! Sessions are created lazily up to `max`, reused across jobs, and
//! destroyed when idle too long, when a caller flags them as suspect, or
//! when the pool is drained at shutdown.
//!
//! A [`Lease`] owns its session for the duration of one job. Dropping a lease
//! on any path (early return, cancellation, panic) hands the session back to
//! the idle set, so a leased handle can never leak.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, Semaphore, SemaphorePermit};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::traits::SessionLauncher;

/// Configuration for the browser pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Sessions kept warm even when idle.
    pub min: usize,

    /// Hard ceiling on live sessions; normally the worker concurrency.
    pub max: usize,

    /// How long `acquire` waits for a free session before giving up.
    pub acquire_timeout: Duration,

    /// Idle sessions older than this are destroyed (down to `min`).
    pub idle_timeout: Duration,

    /// Period of the idle eviction sweep.
    pub eviction_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 0,
            max: 2,
            acquire_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
            eviction_interval: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn with_max(mut self, max: usize) -> Self {
        self.max = max.max(1);
        self.min = self.min.min(self.max);
        self
    }

    pub fn with_min(mut self, min: usize) -> Self {
        self.min = min.min(self.max);
        self
    }
}

/// Caller's verdict on a session being returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionHealth {
    /// Return to the idle set for reuse.
    Healthy,
    /// Integrity is doubtful; destroy instead of recycling.
    Suspect,
}

/// Point-in-time pool accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub leased: usize,
    pub max: usize,
    pub created: u64,
    pub destroyed: u64,
}

struct IdleSession<S> {
    session: S,
    idle_since: Instant,
}

/// Bounded, lazily-populated pool of sessions produced by a [`SessionLauncher`].
///
/// Shared by reference between all worker slots. Call [`drain`](Self::drain)
/// before dropping the pool; idle sessions are not torn down on drop.
pub struct BrowserPool<L: SessionLauncher> {
    launcher: L,
    config: PoolConfig,
    permits: Semaphore,
    idle: Mutex<VecDeque<IdleSession<L::Session>>>,
    leased: AtomicUsize,
    launching: AtomicUsize,
    created: AtomicU64,
    destroyed: AtomicU64,
    draining: AtomicBool,
    returned: Notify,
}

impl<L: SessionLauncher> BrowserPool<L> {
    pub fn new(launcher: L, config: PoolConfig) -> Self {
        let max = config.max.max(1);
        Self {
            launcher,
            permits: Semaphore::new(max),
            config: PoolConfig { max, ..config },
            idle: Mutex::new(VecDeque::new()),
            leased: AtomicUsize::new(0),
            launching: AtomicUsize::new(0),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            draining: AtomicBool::new(false),
            returned: Notify::new(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    fn lock_idle(&self) -> MutexGuard<'_, VecDeque<IdleSession<L::Session>>> {
        self.idle.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned browser pool mutex");
            PoisonError::into_inner(poisoned)
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.lock_idle().len(),
            leased: self.leased.load(Ordering::Acquire),
            max: self.config.max,
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    fn live(&self, idle: usize) -> usize {
        idle + self.leased.load(Ordering::Acquire) + self.launching.load(Ordering::Acquire)
    }

    /// Pop the most recent idle session, or reserve a launch if there is none.
    fn take_idle(&self) -> Result<L::Session, LaunchSlot<'_>> {
        let mut idle = self.lock_idle();
        match idle.pop_back() {
            Some(entry) => Ok(entry.session),
            None => Err(LaunchSlot::reserve(&self.launching)),
        }
    }

    /// Reserve a launch only while fewer than `min` sessions are live.
    fn reserve_below_min(&self) -> Option<LaunchSlot<'_>> {
        let idle = self.lock_idle();
        (self.live(idle.len()) < self.config.min).then(|| LaunchSlot::reserve(&self.launching))
    }

    /// Lease a session: reuse the most recently returned idle one, or launch
    /// a new one if below `max`. When the pool is saturated, waits up to
    /// `acquire_timeout` and then fails with [`AppError::PoolExhausted`].
    pub async fn acquire(&self) -> Result<Lease<'_, L>, AppError> {
        if self.is_draining() {
            return Err(AppError::PoolClosed);
        }

        let started = Instant::now();
        let permit =
            match tokio::time::timeout(self.config.acquire_timeout, self.permits.acquire()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(AppError::PoolClosed),
                Err(_) => {
                    return Err(AppError::PoolExhausted {
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
            };

        let session = match self.take_idle() {
            Ok(session) => {
                self.leased.fetch_add(1, Ordering::AcqRel);
                session
            }
            Err(slot) => {
                let session = self.launcher.launch().await?;
                let created = self.created.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(created, "Launched browser session");
                self.leased.fetch_add(1, Ordering::AcqRel);
                drop(slot);
                session
            }
        };

        Ok(Lease {
            pool: self,
            session: Some(session),
            _permit: permit,
        })
    }

    /// Return a leased session. Suspect sessions are destroyed immediately.
    pub async fn release(&self, mut lease: Lease<'_, L>, health: SessionHealth) {
        debug_assert!(std::ptr::eq(lease.pool, self), "lease from another pool");

        if health == SessionHealth::Suspect
            && let Some(session) = lease.session.take()
        {
            tracing::debug!("Destroying suspect browser session");
            self.destroy_session(session).await;
        }
        drop(lease);
    }

    fn return_idle(&self, session: L::Session) {
        self.lock_idle().push_back(IdleSession {
            session,
            idle_since: Instant::now(),
        });
    }

    async fn destroy_session(&self, session: L::Session) {
        self.launcher.destroy(session).await;
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Launch sessions until `min` are alive. Each launch holds a permit, so
    /// warming up never pushes the pool past `max`.
    pub async fn warm_up(&self) -> Result<usize, AppError> {
        let mut launched = 0;
        while !self.is_draining() {
            let Ok(permit) = self.permits.try_acquire() else {
                break;
            };
            let Some(slot) = self.reserve_below_min() else {
                break;
            };

            let session = self.launcher.launch().await?;
            self.created.fetch_add(1, Ordering::Relaxed);
            if self.is_draining() {
                self.destroy_session(session).await;
                break;
            }
            self.return_idle(session);
            drop(slot);
            drop(permit);
            launched += 1;
        }
        Ok(launched)
    }

    /// Destroy sessions idle longer than `idle_timeout`, keeping `min` alive.
    /// Returns the number destroyed.
    pub async fn evict_idle(&self) -> usize {
        let expired: Vec<L::Session> = {
            let mut idle = self.lock_idle();
            let mut expired = Vec::new();
            // Oldest entries sit at the front.
            while self.live(idle.len()) > self.config.min
                && idle
                    .front()
                    .is_some_and(|entry| entry.idle_since.elapsed() >= self.config.idle_timeout)
            {
                if let Some(entry) = idle.pop_front() {
                    expired.push(entry.session);
                }
            }
            expired
        };

        let count = expired.len();
        for session in expired {
            self.destroy_session(session).await;
        }
        count
    }

    /// Periodic eviction sweep and `min` top-up. Runs until cancelled or the
    /// pool starts draining.
    pub async fn run_maintenance(&self, cancel: CancellationToken) {
        let period = self.config.eviction_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = cancel.cancelled() => break,
            }
            if self.is_draining() {
                break;
            }

            let evicted = self.evict_idle().await;
            if evicted > 0 {
                tracing::debug!(evicted, "Evicted idle browser sessions");
            }
            if let Err(e) = self.warm_up().await {
                tracing::warn!(error = %e, "Failed to keep minimum browser sessions warm");
            }
        }
    }

    /// Stop handing out sessions, wait for every lease to come back, then
    /// destroy all sessions. Returns the number destroyed.
    pub async fn drain(&self) -> usize {
        self.draining.store(true, Ordering::Release);
        self.permits.close();

        while self.leased.load(Ordering::Acquire) > 0 {
            self.returned.notified().await;
        }

        let sessions: Vec<L::Session> = self.lock_idle().drain(..).map(|e| e.session).collect();
        let count = sessions.len();
        for session in sessions {
            self.destroy_session(session).await;
        }

        tracing::info!(destroyed = count, "Browser pool drained");
        count
    }
}

/// Counts one session launch in flight until dropped.
struct LaunchSlot<'a>(&'a AtomicUsize);

impl<'a> LaunchSlot<'a> {
    fn reserve(launching: &'a AtomicUsize) -> Self {
        launching.fetch_add(1, Ordering::AcqRel);
        Self(launching)
    }
}

impl Drop for LaunchSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A session leased from a [`BrowserPool`], returned to the pool on drop.
pub struct Lease<'a, L: SessionLauncher> {
    pool: &'a BrowserPool<L>,
    session: Option<L::Session>,
    _permit: SemaphorePermit<'a>,
}

impl<L: SessionLauncher> Deref for Lease<'_, L> {
    type Target = L::Session;

    // `session` is only taken by `release` and `Drop`, which both consume the
    // lease, so it is always present here.
    fn deref(&self) -> &Self::Target {
        self.session
            .as_ref()
            .expect("lease holds its session until dropped")
    }
}

impl<L: SessionLauncher> Drop for Lease<'_, L> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.return_idle(session);
        }
        self.pool.leased.fetch_sub(1, Ordering::AcqRel);
        self.pool.returned.notify_one();
    }
}
