//! Per-server health records
//!
//! A [`ServerHealth`] is created the first time the health tick sees a
//! server and is mutated only by the manager while it holds its registry
//! lock.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Consecutive failed calls after which a server is marked unhealthy.
pub const UNHEALTHY_THRESHOLD: u32 = 3;

/// Default reconnect ceiling.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Outcome of folding one observation into a [`ServerHealth`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    /// Nothing changed.
    None,
    /// Healthy -> unhealthy.
    BecameUnhealthy,
    /// Unhealthy -> healthy without a reconnect.
    Recovered,
}

/// Health snapshot for one server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerHealth {
    /// Whether the server is considered usable
    pub healthy: bool,
    /// When the health tick last looked at this server
    pub last_check: Option<DateTime<Utc>>,
    /// Failure streak as read from the client
    pub consecutive_failures: u32,
    /// Reconnects tried since the last success
    pub reconnect_attempts: u32,
    /// Reconnect ceiling
    pub max_reconnect_attempts: u32,
    /// Text of the most recent reconnect failure
    pub last_error: Option<String>,
    /// When the last reconnect was attempted
    pub last_attempt: Option<DateTime<Utc>>,
}

impl ServerHealth {
    /// A healthy record with the given ceiling.
    pub fn new(max_reconnect_attempts: u32) -> Self {
        Self {
            healthy: true,
            last_check: None,
            consecutive_failures: 0,
            reconnect_attempts: 0,
            max_reconnect_attempts,
            last_error: None,
            last_attempt: None,
        }
    }

    /// Fold one observation of a connected client into the record.
    pub fn observe(
        &mut self,
        failures: u32,
        alive: bool,
        threshold: u32,
        now: DateTime<Utc>,
    ) -> HealthTransition {
        self.last_check = Some(now);
        self.consecutive_failures = failures;

        let healthy = alive && failures < threshold;
        let transition = match (self.healthy, healthy) {
            (true, false) => HealthTransition::BecameUnhealthy,
            (false, true) => HealthTransition::Recovered,
            _ => HealthTransition::None,
        };
        self.healthy = healthy;
        transition
    }

    /// Mark a server unhealthy without a client to observe (it was
    /// dropped by a failed reconnect).
    pub fn mark_disconnected(&mut self, now: DateTime<Utc>) -> HealthTransition {
        self.last_check = Some(now);
        if self.healthy {
            self.healthy = false;
            HealthTransition::BecameUnhealthy
        } else {
            HealthTransition::None
        }
    }

    /// Whether another reconnect may be attempted at `now`.
    pub fn can_retry(&self, retry_delay: Duration, now: DateTime<Utc>) -> bool {
        if self.healthy || self.reconnect_attempts >= self.max_reconnect_attempts {
            return false;
        }
        match self.last_attempt {
            None => true,
            Some(last) => {
                let delay = chrono::Duration::from_std(retry_delay)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                now - last >= delay
            }
        }
    }

    /// Record the start of a reconnect attempt.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) {
        self.reconnect_attempts += 1;
        self.last_attempt = Some(now);
    }

    /// Reset after a successful reconnect.
    pub fn mark_reconnected(&mut self, now: DateTime<Utc>) {
        self.healthy = true;
        self.consecutive_failures = 0;
        self.reconnect_attempts = 0;
        self.last_error = None;
        self.last_check = Some(now);
    }

    /// Whether the ceiling has been reached.
    pub fn exhausted(&self) -> bool {
        self.reconnect_attempts >= self.max_reconnect_attempts
    }
}

impl Default for ServerHealth {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECONNECT_ATTEMPTS)
    }
}
