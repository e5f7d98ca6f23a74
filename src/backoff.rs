// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnect Backoff
//!
//! Maps a dial attempt index to the delay the client sleeps before dialing.
//! The delay follows a fixed schedule clamped to its last entry and is
//! jittered around the scheduled value so that many clients losing the same
//! broker do not reconnect in lockstep.

use rand::Rng;
use std::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

/// Schedule used when no other policy is configured, in milliseconds.
pub const DEFAULT_SCHEDULE_MS: [u64; 9] = [0, 10, 100, 200, 500, 1000, 2000, 3000, 5000];

/// Computes the delay before a dial attempt.
pub trait Backoff: Send + Sync {
    /// Returns the delay to wait before dial attempt number `attempt`.
    fn backoff(&self, attempt: u32) -> Duration;
}

/// Schedule based backoff with jitter.
///
/// For a scheduled value `v` (in milliseconds) the returned delay lies in
/// `[v/2, v + v/2)`, averaging `v`. A scheduled zero is never jittered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    schedule_ms: Vec<u64>,
}

impl BackoffPolicy {
    /// Creates a policy from a non-decreasing schedule in milliseconds.
    ///
    /// An empty schedule never waits.
    pub fn new(schedule_ms: Vec<u64>) -> Self {
        BackoffPolicy { schedule_ms }
    }

    /// Scheduled value for `attempt`, clamped to the last entry.
    pub fn base(&self, attempt: u32) -> u64 {
        if self.schedule_ms.is_empty() {
            return 0;
        }

        let index = (attempt as usize).min(self.schedule_ms.len() - 1);
        self.schedule_ms[index]
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::new(DEFAULT_SCHEDULE_MS.to_vec())
    }
}

impl fmt::Display for BackoffPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BackoffPolicy({:?}ms)", self.schedule_ms)
    }
}

impl Backoff for BackoffPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(jitter(self.base(attempt)))
    }
}

fn jitter(ms: u64) -> u64 {
    if ms == 0 {
        return 0;
    }

    ms / 2 + rand::thread_rng().gen_range(0..ms)
}

/// Dial attempt counter owned by the client.
#[derive(Debug, Default)]
pub(crate) struct BackoffState {
    attempt: AtomicU32,
}

impl BackoffState {
    pub(crate) fn current(&self) -> u32 {
        self.attempt.load(Ordering::SeqCst)
    }

    /// Records one more dial attempt and returns the index it was made with.
    pub(crate) fn advance(&self) -> u32 {
        self.attempt.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.attempt.store(0, Ordering::SeqCst);
    }
}
