use serde::{Deserialize, Serialize};

/// Which load figure the health check reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyMetric {
    #[default]
    Smoothed,
    Raw,
}

/// Safety tiers and countdown settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub enabled: bool,
    pub warn_mspt: f64,
    pub countdown_mspt: f64,
    pub immediate_mspt: f64,
    /// Readings at or above the countdown tier needed to start the countdown.
    pub consecutive_required: u32,
    pub countdown_secs: u32,
    pub check_period_ms: u64,
    pub metric: SafetyMetric,
    /// Shown to disconnected sessions.
    pub disconnect_reason: String,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warn_mspt: 92.0,
            countdown_mspt: 142.0,
            immediate_mspt: 200.0,
            consecutive_required: 4,
            countdown_secs: 20,
            check_period_ms: 1_000,
            metric: SafetyMetric::Smoothed,
            disconnect_reason: "Server is shutting down to recover from extreme load.".into(),
        }
    }
}

/// Something the host has to do after a check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyAction {
    Broadcast(String),
    /// Stop every other periodic task.
    CancelTimers,
    /// Save, disconnect everyone with `reason` and terminate the host.
    Finalize { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SafetyPhase {
    Normal,
    Warned,
    /// Counting down with this many seconds left.
    Countdown(u32),
    Finalized,
}

/// Counters for instrumentation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SafetyStats {
    pub checks: u64,
    pub warnings: u64,
    pub countdowns_started: u64,
    pub countdowns_aborted: u64,
    pub last_reading: f64,
}

/// The escalation state machine. Pure: every check returns the actions to
/// perform and touches nothing else.
pub struct SafetyController {
    pub config: SafetyConfig,
    warned: bool,
    consecutive: u32,
    countdown: Option<u32>,
    finalized: bool,
    stats: SafetyStats,
}

impl SafetyController {
    pub fn new(config: SafetyConfig) -> Self {
        Self {
            config,
            warned: false,
            consecutive: 0,
            countdown: None,
            finalized: false,
            stats: SafetyStats::default(),
        }
    }

    pub fn phase(&self) -> SafetyPhase {
        if self.finalized {
            SafetyPhase::Finalized
        } else if let Some(left) = self.countdown {
            SafetyPhase::Countdown(left)
        } else if self.warned {
            SafetyPhase::Warned
        } else {
            SafetyPhase::Normal
        }
    }

    pub fn stats(&self) -> SafetyStats {
        self.stats
    }

    /// Evaluate one reading. Non-finite or negative readings count as 0.
    pub fn check(&mut self, reading: f64) -> Vec<SafetyAction> {
        if self.finalized {
            return Vec::new();
        }
        let _span = tracing::info_span!("safety_check").entered();
        let reading = if reading.is_finite() && reading > 0.0 {
            reading
        } else {
            0.0
        };
        self.stats.checks += 1;
        self.stats.last_reading = reading;
        let mut actions = Vec::new();

        if reading >= self.config.immediate_mspt {
            tracing::error!(reading, tier = self.config.immediate_mspt, "extreme load, forcing shutdown");
            self.countdown = None;
            actions.push(SafetyAction::CancelTimers);
            actions.push(self.finalize());
            return actions;
        }

        self.check_countdown(reading, &mut actions);
        if self.finalized {
            return actions;
        }

        if reading >= self.config.warn_mspt {
            if !self.warned {
                self.warned = true;
                self.stats.warnings += 1;
                tracing::warn!(reading, tier = self.config.warn_mspt, "load warning");
                actions.push(SafetyAction::Broadcast(format!(
                    "[ballast] Server is under heavy load ({reading:.0} ms per tick)."
                )));
            }
        } else {
            self.warned = false;
        }
        actions
    }

    fn check_countdown(&mut self, reading: f64, actions: &mut Vec<SafetyAction>) {
        if reading < self.config.countdown_mspt {
            self.consecutive = 0;
            if self.countdown.take().is_some() {
                self.stats.countdowns_aborted += 1;
                tracing::info!(reading, "load recovered, shutdown aborted");
                actions.push(SafetyAction::Broadcast(
                    "[ballast] Server recovered. Shutdown aborted.".into(),
                ));
            }
            return;
        }

        self.consecutive = self.consecutive.saturating_add(1);
        match self.countdown {
            Some(left) => {
                let left = left.saturating_sub(1);
                if left == 0 {
                    self.countdown = None;
                    actions.push(self.finalize());
                    return;
                }
                self.countdown = Some(left);
                if left <= 5 || left % 5 == 0 {
                    tracing::warn!(left, "shutdown countdown");
                    actions.push(SafetyAction::Broadcast(format!(
                        "[ballast] Server shutting down in {left} seconds. Please disconnect."
                    )));
                }
            }
            None if self.consecutive >= self.config.consecutive_required.max(1) => {
                let secs = self.config.countdown_secs.max(1);
                self.countdown = Some(secs);
                self.stats.countdowns_started += 1;
                tracing::warn!(reading, secs, "sustained critical load, countdown started");
                actions.push(SafetyAction::Broadcast(format!(
                    "[ballast] Server performance critically degraded. Shutting down in {secs} seconds. Please disconnect immediately."
                )));
            }
            None => {}
        }
    }

    fn finalize(&mut self) -> SafetyAction {
        self.finalized = true;
        SafetyAction::Finalize {
            reason: self.config.disconnect_reason.clone(),
        }
    }

    /// Back to a clean state, e.g. after a restart of the controller.
    pub fn reset(&mut self) {
        self.warned = false;
        self.consecutive = 0;
        self.countdown = None;
        self.finalized = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> SafetyController {
        SafetyController::new(SafetyConfig::default())
    }

    fn broadcasts(actions: &[SafetyAction]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, SafetyAction::Broadcast(_)))
            .count()
    }

    #[test]
    fn warn_once_per_excursion() {
        let mut c = controller();
        assert_eq!(broadcasts(&c.check(100.0)), 1);
        assert!(c.check(100.0).is_empty());
        assert_eq!(c.phase(), SafetyPhase::Warned);
        assert!(c.check(50.0).is_empty());
        assert_eq!(c.phase(), SafetyPhase::Normal);
        assert_eq!(broadcasts(&c.check(95.0)), 1);
        assert_eq!(c.stats().warnings, 2);
    }

    #[test]
    fn countdown_needs_consecutive_readings() {
        let mut c = controller();
        for _ in 0..3 {
            c.check(150.0);
        }
        assert_eq!(c.phase(), SafetyPhase::Warned);
        c.check(150.0);
        assert_eq!(c.phase(), SafetyPhase::Countdown(20));
    }

    #[test]
    fn interrupted_streak_starts_over() {
        let mut c = controller();
        for _ in 0..3 {
            c.check(150.0);
        }
        c.check(120.0);
        for _ in 0..3 {
            c.check(150.0);
        }
        assert!(!matches!(c.phase(), SafetyPhase::Countdown(_)));
    }

    #[test]
    fn countdown_broadcast_schedule_and_finalize() {
        let mut c = controller();
        for _ in 0..4 {
            c.check(150.0);
        }
        let mut announced = Vec::new();
        let mut finalized = false;
        for _ in 0..20 {
            for action in c.check(150.0) {
                match action {
                    SafetyAction::Broadcast(_) => {
                        if let SafetyPhase::Countdown(left) = c.phase() {
                            announced.push(left);
                        }
                    }
                    SafetyAction::Finalize { .. } => finalized = true,
                    SafetyAction::CancelTimers => {}
                }
            }
        }
        assert_eq!(announced, vec![15, 10, 5, 4, 3, 2, 1]);
        assert!(finalized);
        assert_eq!(c.phase(), SafetyPhase::Finalized);
        assert!(c.check(500.0).is_empty());
    }

    #[test]
    fn one_good_reading_aborts_countdown() {
        let mut c = controller();
        for _ in 0..6 {
            c.check(150.0);
        }
        let actions = c.check(100.0);
        assert_eq!(
            actions,
            vec![SafetyAction::Broadcast(
                "[ballast] Server recovered. Shutdown aborted.".into()
            )]
        );
        assert_eq!(c.phase(), SafetyPhase::Warned);
        assert_eq!(c.stats().countdowns_aborted, 1);
    }

    #[test]
    fn immediate_tier_cancels_and_finalizes() {
        let mut c = controller();
        let actions = c.check(250.0);
        assert_eq!(actions[0], SafetyAction::CancelTimers);
        assert!(matches!(actions[1], SafetyAction::Finalize { .. }));
        assert_eq!(c.phase(), SafetyPhase::Finalized);
    }

    #[test]
    fn garbage_readings_count_as_idle() {
        let mut c = controller();
        for reading in [f64::NAN, f64::INFINITY, -5.0] {
            assert!(c.check(reading).is_empty());
        }
        assert_eq!(c.stats().last_reading, 0.0);
        assert_eq!(c.phase(), SafetyPhase::Normal);
    }
}
