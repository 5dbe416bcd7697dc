//! Per-host failure window
//!
//! Each target host keeps its most recent fetch outcomes. When soft failures
//! dominate the window the host enters backoff, and it returns to normal
//! after a quiet cooldown.

use crate::config::BanDetectionConfig;
use std::collections::VecDeque;
use tokio::time::Instant;

/// Operating mode of a target host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostMode {
    /// Fetched at the configured rate
    Normal,

    /// Fetched at a reduced rate after excessive soft failures
    Backoff {
        /// When the host entered backoff
        since: Instant,
        /// Most recent soft failure seen while in backoff
        last_soft_failure: Instant,
    },
}

/// A change of host mode produced by recording an outcome or refreshing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostTransition {
    Unchanged,
    EnteredBackoff,
    ClearedBackoff,
}

/// Tracks the recent fetch history of one target host
///
/// The host keeps a sliding window of the last `window` outcomes. Once the
/// window holds at least `min_samples` entries and the soft failure ratio
/// exceeds `threshold`, the host enters BACKOFF. It leaves BACKOFF after
/// `cooldown` passes without another soft failure.
#[derive(Debug, Clone)]
pub struct HostState {
    /// Recent outcomes, `true` for a soft failure (oldest first)
    recent: VecDeque<bool>,

    /// Current mode
    pub mode: HostMode,

    /// Fetches recorded over the lifetime of this state
    pub total_fetches: u64,

    /// Soft failures recorded over the lifetime of this state
    pub total_soft_failures: u64,
}

impl HostState {
    pub fn new() -> Self {
        Self {
            recent: VecDeque::new(),
            mode: HostMode::Normal,
            total_fetches: 0,
            total_soft_failures: 0,
        }
    }

    /// Records the outcome of one fetch against this host
    ///
    /// Hard failures and successes are both recorded as non-soft outcomes:
    /// only transient failures count toward ban detection.
    pub fn record(
        &mut self,
        soft_failure: bool,
        now: Instant,
        config: &BanDetectionConfig,
    ) -> HostTransition {
        self.total_fetches += 1;
        self.recent.push_back(soft_failure);
        while self.recent.len() > config.window {
            self.recent.pop_front();
        }

        if soft_failure {
            self.total_soft_failures += 1;
        }

        if let HostMode::Backoff {
            last_soft_failure, ..
        } = &mut self.mode
        {
            if soft_failure {
                *last_soft_failure = now;
            }
            return HostTransition::Unchanged;
        }

        let over_threshold = self
            .failure_ratio(config.min_samples)
            .map(|ratio| ratio > config.threshold)
            .unwrap_or(false);

        if soft_failure && over_threshold {
            self.mode = HostMode::Backoff {
                since: now,
                last_soft_failure: now,
            };
            HostTransition::EnteredBackoff
        } else {
            HostTransition::Unchanged
        }
    }

    /// Ends backoff once the cooldown has passed without a soft failure
    ///
    /// The window is cleared on exit so the failures that caused the backoff
    /// cannot immediately trigger it again.
    pub fn refresh(&mut self, now: Instant, config: &BanDetectionConfig) -> HostTransition {
        if let HostMode::Backoff {
            last_soft_failure, ..
        } = self.mode
        {
            if now.duration_since(last_soft_failure) >= config.cooldown() {
                self.mode = HostMode::Normal;
                self.recent.clear();
                return HostTransition::ClearedBackoff;
            }
        }
        HostTransition::Unchanged
    }

    /// Returns true while the host is in backoff
    pub fn in_backoff(&self) -> bool {
        matches!(self.mode, HostMode::Backoff { .. })
    }

    /// Soft failure ratio over the window, if enough samples exist
    pub fn failure_ratio(&self, min_samples: usize) -> Option<f64> {
        if self.recent.is_empty() || self.recent.len() < min_samples {
            return None;
        }
        let failures = self.recent.iter().filter(|soft| **soft).count();
        Some(failures as f64 / self.recent.len() as f64)
    }

    /// Number of outcomes currently in the window
    pub fn window_len(&self) -> usize {
        self.recent.len()
    }
}

impl Default for HostState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn create_test_config() -> BanDetectionConfig {
        BanDetectionConfig {
            window: 20,
            min_samples: 10,
            threshold: 0.4,
            backoff_factor: 0.25,
            cooldown_secs: 60,
        }
    }

    #[test]
    fn test_new_host_state() {
        let state = HostState::new();
        assert_eq!(state.mode, HostMode::Normal);
        assert_eq!(state.window_len(), 0);
        assert!(state.failure_ratio(1).is_none());
    }

    #[test]
    fn test_ten_soft_failures_enter_backoff() {
        let config = create_test_config();
        let mut state = HostState::new();
        let now = Instant::now();

        for i in 0..9 {
            let transition = state.record(true, now, &config);
            assert_eq!(transition, HostTransition::Unchanged, "fetch {}", i);
        }
        assert!(!state.in_backoff());

        assert_eq!(
            state.record(true, now, &config),
            HostTransition::EnteredBackoff
        );
        assert!(state.in_backoff());
    }

    #[test]
    fn test_ratio_below_threshold_stays_normal() {
        let config = create_test_config();
        let mut state = HostState::new();
        let now = Instant::now();

        // 4 failures in 20 fetches = 20%
        for i in 0..20 {
            state.record(i % 5 == 4, now, &config);
        }
        assert!(!state.in_backoff());
        assert_eq!(state.failure_ratio(10), Some(0.2));
    }

    #[test]
    fn test_window_slides() {
        let config = create_test_config();
        let mut state = HostState::new();
        let now = Instant::now();

        for _ in 0..25 {
            state.record(false, now, &config);
        }
        assert_eq!(state.window_len(), 20);
        assert_eq!(state.total_fetches, 25);
    }

    #[test]
    fn test_success_never_enters_backoff() {
        let config = create_test_config();
        let mut state = HostState::new();
        let now = Instant::now();

        for _ in 0..9 {
            state.record(true, now, &config);
        }
        // Ratio is over threshold but the triggering outcome is a success
        assert_eq!(
            state.record(false, now, &config),
            HostTransition::Unchanged
        );
        assert!(!state.in_backoff());
    }

    #[test]
    fn test_backoff_clears_after_quiet_cooldown() {
        let config = create_test_config();
        let mut state = HostState::new();
        let start = Instant::now();

        for _ in 0..10 {
            state.record(true, start, &config);
        }
        assert!(state.in_backoff());

        let later = start + Duration::from_secs(30);
        state.record(true, later, &config);
        assert_eq!(
            state.refresh(later + Duration::from_secs(59), &config),
            HostTransition::Unchanged
        );

        assert_eq!(
            state.refresh(later + Duration::from_secs(60), &config),
            HostTransition::ClearedBackoff
        );
        assert!(!state.in_backoff());
        assert_eq!(state.window_len(), 0);
    }
}
