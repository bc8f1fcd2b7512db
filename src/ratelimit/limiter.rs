//! Sliding-window call budget with graded throttling
//!
//! The window holds one record per outbound call made in the last 60
//! seconds. It is pruned on every read, so no background task is needed.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::providers::ProviderError;

/// Length of the sliding window
pub const WINDOW: Duration = Duration::from_secs(60);

/// Budget and thresholds for the limiter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Calls allowed per 60-second window
    pub calls_per_minute: usize,
    /// Usage ratio where warning-level delays start
    pub warning_ratio: f64,
    /// Usage ratio where critical-level delays start
    pub critical_ratio: f64,
    /// Usage ratio where non-essential calls are refused
    pub hard_ratio: f64,
    pub warning_delay_ms: u64,
    pub critical_delay_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            calls_per_minute: 100,
            warning_ratio: 0.6,
            critical_ratio: 0.8,
            hard_ratio: 0.95,
            warning_delay_ms: 250,
            critical_delay_ms: 1000,
        }
    }
}

impl RateLimitConfig {
    pub fn with_calls_per_minute(mut self, calls: usize) -> Self {
        self.calls_per_minute = calls;
        self
    }

    pub fn warning_delay(&self) -> Duration {
        Duration::from_millis(self.warning_delay_ms)
    }

    pub fn critical_delay(&self) -> Duration {
        Duration::from_millis(self.critical_delay_ms)
    }

    /// Checks the budget is positive and thresholds are ordered within (0, 1]
    pub fn validate(&self) -> Result<(), String> {
        if self.calls_per_minute == 0 {
            return Err("calls_per_minute must be greater than zero".to_string());
        }

        let ordered = 0.0 < self.warning_ratio
            && self.warning_ratio <= self.critical_ratio
            && self.critical_ratio <= self.hard_ratio
            && self.hard_ratio <= 1.0;
        if !ordered {
            return Err(format!(
                "thresholds must satisfy 0 < warning ({}) <= critical ({}) <= hard ({}) <= 1",
                self.warning_ratio, self.critical_ratio, self.hard_ratio
            ));
        }

        Ok(())
    }
}

/// How hard the limiter is currently pushing back
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThrottleLevel {
    Normal,
    Warning,
    Critical,
    Blocked,
}

impl fmt::Display for ThrottleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThrottleLevel::Normal => "normal",
            ThrottleLevel::Warning => "warning",
            ThrottleLevel::Critical => "critical",
            ThrottleLevel::Blocked => "blocked",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
struct CallRecord {
    at: Instant,
    endpoint: String,
}

/// Snapshot of the limiter state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStats {
    pub current_count: usize,
    pub remaining: usize,
    pub budget: usize,
    pub usage_ratio: f64,
    pub level: ThrottleLevel,
    /// Calls per endpoint in the current window
    pub by_endpoint: BTreeMap<String, usize>,
}

/// Per-minute call budget shared by every outbound call
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    window: Mutex<VecDeque<CallRecord>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            window: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Locks the window and drops records older than [`WINDOW`]
    fn pruned(&self) -> MutexGuard<'_, VecDeque<CallRecord>> {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        while window
            .front()
            .is_some_and(|record| now.duration_since(record.at) >= WINDOW)
        {
            window.pop_front();
        }
        window
    }

    pub fn current_count(&self) -> usize {
        self.pruned().len()
    }

    pub fn remaining(&self) -> usize {
        self.config.calls_per_minute.saturating_sub(self.current_count())
    }

    /// Fraction of the budget used in the current window
    pub fn usage_ratio(&self) -> f64 {
        self.ratio_for(self.current_count())
    }

    fn ratio_for(&self, count: usize) -> f64 {
        count as f64 / self.config.calls_per_minute.max(1) as f64
    }

    fn level_for(&self, count: usize) -> ThrottleLevel {
        let ratio = self.ratio_for(count);
        if ratio >= self.config.hard_ratio {
            ThrottleLevel::Blocked
        } else if ratio >= self.config.critical_ratio {
            ThrottleLevel::Critical
        } else if ratio >= self.config.warning_ratio {
            ThrottleLevel::Warning
        } else {
            ThrottleLevel::Normal
        }
    }

    pub fn throttle_level(&self) -> ThrottleLevel {
        self.level_for(self.current_count())
    }

    fn delay_for(&self, level: ThrottleLevel) -> Duration {
        match level {
            ThrottleLevel::Normal => Duration::ZERO,
            ThrottleLevel::Warning => self.config.warning_delay(),
            ThrottleLevel::Critical | ThrottleLevel::Blocked => self.config.critical_delay(),
        }
    }

    /// Delay to apply before the next call
    pub fn delay(&self) -> Duration {
        self.delay_for(self.throttle_level())
    }

    /// True once usage reaches the hard ratio
    pub fn should_block(&self) -> bool {
        self.throttle_level() == ThrottleLevel::Blocked
    }

    /// Records a call made now
    pub fn record(&self, endpoint: &str) {
        let mut window = self.pruned();
        window.push_back(CallRecord {
            at: Instant::now(),
            endpoint: endpoint.to_string(),
        });
    }

    /// Whole seconds until the oldest call leaves the window (at least 1)
    pub fn retry_after(&self) -> u64 {
        let window = self.pruned();
        let Some(oldest) = window.front() else {
            return 1;
        };

        let left = WINDOW.saturating_sub(Instant::now().duration_since(oldest.at));
        let secs = left.as_secs() + u64::from(left.subsec_nanos() > 0);
        secs.max(1)
    }

    /// Waits for the throttle delay and records the call
    ///
    /// Non-essential calls are refused with [`ProviderError::RateLimitExceeded`]
    /// once the limiter is blocked; essential calls always proceed.
    pub async fn acquire(&self, endpoint: &str, essential: bool) -> Result<(), ProviderError> {
        let count = self.current_count();
        let level = self.level_for(count);

        if level == ThrottleLevel::Blocked && !essential {
            let retry_after = self.retry_after();
            warn!(
                endpoint = %endpoint,
                used = count,
                budget = self.config.calls_per_minute,
                retry_after_secs = retry_after,
                "Call budget exhausted, refusing non-essential call"
            );
            return Err(ProviderError::rate_limit_exceeded(
                count,
                self.config.calls_per_minute,
                retry_after,
            ));
        }

        let delay = self.delay_for(level);
        if !delay.is_zero() {
            debug!(endpoint = %endpoint, level = %level, delay_ms = delay.as_millis() as u64, "Throttling call");
            tokio::time::sleep(delay).await;
        }

        self.record(endpoint);
        Ok(())
    }

    /// Refresh interval multiplier for background pollers
    pub fn refresh_multiplier(&self) -> u32 {
        match self.throttle_level() {
            ThrottleLevel::Normal => 1,
            ThrottleLevel::Warning => 2,
            ThrottleLevel::Critical => 4,
            ThrottleLevel::Blocked => 8,
        }
    }

    /// How many items a caller should fetch in its next batch
    ///
    /// Half the remaining budget, halved again at critical, one when
    /// blocked. Never more than requested and never zero for a non-zero
    /// request.
    pub fn batch_size(&self, requested: usize) -> usize {
        if requested == 0 {
            return 0;
        }

        let count = self.current_count();
        let remaining = self.config.calls_per_minute.saturating_sub(count);
        let advised = match self.level_for(count) {
            ThrottleLevel::Normal | ThrottleLevel::Warning => remaining / 2,
            ThrottleLevel::Critical => remaining / 4,
            ThrottleLevel::Blocked => 1,
        };

        advised.clamp(1, requested)
    }

    pub fn stats(&self) -> RateLimitStats {
        let window = self.pruned();
        let count = window.len();

        let mut by_endpoint = BTreeMap::new();
        for record in window.iter() {
            *by_endpoint.entry(record.endpoint.clone()).or_insert(0) += 1;
        }
        drop(window);

        RateLimitStats {
            current_count: count,
            remaining: self.config.calls_per_minute.saturating_sub(count),
            budget: self.config.calls_per_minute,
            usage_ratio: self.ratio_for(count),
            level: self.level_for(count),
            by_endpoint,
        }
    }

    /// Forgets every recorded call
    pub fn reset(&self) {
        self.window.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
