//! # Server State
//!
//! State shared by every connection task of the recognition server.
//!
//! ## Sharing pattern:
//! - The configuration is read-only once the server runs, so it sits behind a plain `Arc`
//! - Counters are updated by every session, so they sit behind `Arc<RwLock<_>>`
//!
//! Cloning `AppState` clones the handles, not the data.
//!
//! ## Key Rust Concepts:
//! - **Arc**: every connection task owns a handle; the data lives until the last one drops
//! - **RwLock**: many readers (snapshots) or one writer (a counter update) at a time
//! - **Poisoning**: a panicking writer poisons a std lock; we take the guard anyway

use crate::config::AppConfig;  // Read-only once the server runs
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;       // Monotonic clock for uptime

#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,

    /// Session counters, updated as connections come and go
    pub metrics: Arc<RwLock<SessionMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected across all sessions.
///
/// ## Why these counters matter:
/// - **active_sessions**: current load, bounded by `server.max_connections`
/// - **failed_sessions**: sessions torn down by an error or timeout rather than `CLOSE_SOCKET`
/// - **final_results_sent**: sessions that got as far as answering the client
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionMetrics {
    pub total_sessions: u64,
    pub active_sessions: u32,
    pub failed_sessions: u64,
    pub final_results_sent: u64,
    pub audio_bytes_received: u64,
}

impl SessionMetrics {
    /// Share of finished sessions that failed (0.0 to 1.0).
    pub fn failure_rate(&self) -> f64 {
        let finished = self.total_sessions - self.active_sessions as u64;
        if finished > 0 {
            self.failed_sessions as f64 / finished as f64
        } else {
            0.0
        }
    }
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(SessionMetrics::default())),
            start_time: Instant::now(),
        }
    }

    // A panicking session must not take the counters down with it
    fn write(&self) -> RwLockWriteGuard<'_, SessionMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an accepted connection.
    pub fn session_started(&self) {
        let mut metrics = self.write();
        metrics.total_sessions += 1;
        metrics.active_sessions += 1;
    }

    /// Record a finished connection.
    ///
    /// Guards against underflow so an unbalanced call cannot panic.
    pub fn session_finished(&self, failed: bool) {
        let mut metrics = self.write();
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
        if failed {
            metrics.failed_sessions += 1;
        }
    }

    pub fn final_result_sent(&self) {
        self.write().final_results_sent += 1;
    }

    pub fn audio_received(&self, bytes: usize) {
        self.write().audio_bytes_received += bytes as u64;
    }

    /// Copy of the counters, taken under one read lock.
    pub fn get_metrics_snapshot(&self) -> SessionMetrics {
        self.read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
