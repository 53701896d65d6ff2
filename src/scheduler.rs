// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Maintenance Scheduler
//!
//! Two recurring jobs over the store: expired login challenges are reaped
//! every ten minutes, and the offline queue is purged daily at 03:00 UTC
//! (expired rows first, then anything older than the retention window).
//! Job failures are logged and never stop the loop.
//!
//! `start()` is idempotent; `stop()` aborts the spawned tasks so tests can
//! tear the scheduler down cleanly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{TimeZone, Utc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::store::Store;

/// How often expired challenges are reaped.
pub const CHALLENGE_REAP_INTERVAL: Duration = Duration::from_secs(600);

/// UTC hour of the daily queue purge.
pub const QUEUE_REAP_HOUR_UTC: u32 = 3;

/// Queued messages older than this are purged regardless of expiry.
pub const QUEUE_RETENTION: Duration = Duration::from_secs(30 * 24 * 3600);

fn now_unix_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Removes expired challenge rows. Returns the number removed.
pub fn run_challenge_reaper(store: &Store) -> usize {
    match store.purge_expired_challenges(now_unix_s()) {
        Ok(removed) => {
            if removed > 0 {
                info!("Cleaned up {} expired challenges", removed);
            }
            removed
        }
        Err(e) => {
            warn!("Challenge reaper failed: {}", e);
            0
        }
    }
}

/// Purges expired queued messages, then messages past retention.
/// Returns both counts.
pub fn run_queue_reaper(store: &Store) -> (usize, usize) {
    let now = now_unix_s();
    let expired = match store.purge_expired_messages(now) {
        Ok(n) => n,
        Err(e) => {
            warn!("Queue reaper (expiry pass) failed: {}", e);
            0
        }
    };
    let overage = match store.purge_messages_older_than(now.saturating_sub(QUEUE_RETENTION.as_secs()))
    {
        Ok(n) => n,
        Err(e) => {
            warn!("Queue reaper (retention pass) failed: {}", e);
            0
        }
    };
    if expired + overage > 0 {
        info!(
            "Cleaned up {} expired and {} over-retention queued messages",
            expired, overage
        );
    }
    (expired, overage)
}

/// Seconds until the next occurrence of `hour:00:00` UTC.
fn seconds_until_utc_hour(hour: u32) -> u64 {
    let now = Utc::now();
    let today = now.date_naive().and_hms_opt(hour, 0, 0).unwrap_or_default();
    let mut next = Utc.from_utc_datetime(&today);
    if next <= now {
        next += chrono::Duration::days(1);
    }
    (next - now).num_seconds().max(1) as u64
}

pub struct Scheduler {
    store: Arc<Store>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Scheduler {
    pub fn new(store: Arc<Store>) -> Self {
        Scheduler {
            store,
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Starts both maintenance jobs. A second call is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut handles = self.handles.lock().unwrap();

        let challenge_store = self.store.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(CHALLENGE_REAP_INTERVAL).await;
                run_challenge_reaper(&challenge_store);
            }
        }));

        let queue_store = self.store.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let wait = seconds_until_utc_hour(QUEUE_REAP_HOUR_UTC);
                tokio::time::sleep(Duration::from_secs(wait)).await;
                run_queue_reaper(&queue_store);
            }
        }));

        info!(
            "Scheduler started: challenge reaper every {}s, queue reaper daily at {:02}:00 UTC",
            CHALLENGE_REAP_INTERVAL.as_secs(),
            QUEUE_REAP_HOUR_UTC
        );
    }

    /// Cancels all scheduled ticks. Safe to call from tests and repeatedly.
    pub fn stop(&self) {
        let mut handles = self.handles.lock().unwrap();
        for handle in handles.drain(..) {
            handle.abort();
        }
        self.started.store(false, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn task_count(&self) -> usize {
        self.handles.lock().unwrap().len()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
