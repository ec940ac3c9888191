use std::sync::Arc;

use ballast_common::{Clock, WorldHost, WorldMutation};
use ballast_pipeline::{ApplyReport, Domain, PhaseError};
use ballast_telemetry::{ScaleReader, ScaleSample, lerp_int};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HorizonConfig {
    pub enabled: bool,
    pub min_view: u32,
    pub max_view: u32,
    pub min_simulation: u32,
    pub max_simulation: u32,
    /// Above this cost trend both horizons are clamped to their minimum.
    pub spike_velocity: f64,
    /// Above this cost trend both horizons drop by one.
    pub rising_velocity: f64,
    pub floor_view: u32,
    pub floor_simulation: u32,
    /// Minimum time between growing changes.
    pub cooldown_ms: u64,
    pub period_ms: u64,
}

impl Default for HorizonConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_view: 6,
            max_view: 10,
            min_simulation: 4,
            max_simulation: 8,
            spike_velocity: 5.0,
            rising_velocity: 2.0,
            floor_view: 4,
            floor_simulation: 3,
            cooldown_ms: 30_000,
            period_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Horizons {
    pub view: u32,
    pub simulation: u32,
}

impl Horizons {
    fn shrinks_from(self, current: Horizons) -> bool {
        self.view < current.view || self.simulation < current.simulation
    }
}

#[derive(Debug, Default)]
struct HorizonState {
    current: Option<Horizons>,
    changed_at: u64,
}

pub struct HorizonInput {
    pub now: u64,
    pub sample: ScaleSample,
}

/// Shrinks view and simulation horizons with load.
pub struct HorizonController {
    config: HorizonConfig,
    clock: Arc<dyn Clock>,
    scale: ScaleReader,
    state: Mutex<HorizonState>,
}

impl HorizonController {
    pub fn new(config: HorizonConfig, clock: Arc<dyn Clock>, scale: ScaleReader) -> Self {
        Self {
            config,
            clock,
            scale,
            state: Mutex::new(HorizonState::default()),
        }
    }

    pub fn config(&self) -> &HorizonConfig {
        &self.config
    }

    pub fn current(&self) -> Option<Horizons> {
        self.state.lock().current
    }

    /// Horizons wanted for a scale and cost trend.
    pub fn target(&self, scale: f64, velocity: f64) -> Horizons {
        let cfg = &self.config;
        let mut view = lerp_int(cfg.min_view as i32, cfg.max_view as i32, scale).max(0) as u32;
        let mut simulation =
            lerp_int(cfg.min_simulation as i32, cfg.max_simulation as i32, scale).max(0) as u32;
        if velocity > cfg.spike_velocity {
            view = view.min(cfg.min_view);
            simulation = simulation.min(cfg.min_simulation);
        } else if velocity > cfg.rising_velocity {
            view = view.saturating_sub(1).max(cfg.floor_view);
            simulation = simulation.saturating_sub(1).max(cfg.floor_simulation);
        }
        Horizons { view, simulation }
    }
}

impl Domain for HorizonController {
    type Snapshot = HorizonInput;
    type Decision = Option<Horizons>;

    fn name(&self) -> &'static str {
        "horizon"
    }

    fn snapshot(&self, _host: &dyn WorldHost) -> Result<Self::Snapshot, PhaseError> {
        if !self.config.enabled {
            return Err(PhaseError::Disabled { domain: self.name() });
        }
        Ok(HorizonInput {
            now: self.clock.now_ms(),
            sample: self.scale.sample(),
        })
    }

    fn compute(&self, input: Self::Snapshot) -> Result<Self::Decision, PhaseError> {
        let target = self.target(input.sample.scale, input.sample.velocity);
        let state = self.state.lock();
        let Some(current) = state.current else {
            return Ok(Some(target));
        };
        if target == current {
            return Ok(None);
        }
        let cooled = input.now.saturating_sub(state.changed_at) >= self.config.cooldown_ms;
        Ok((cooled || target.shrinks_from(current)).then_some(target))
    }

    fn apply(
        &self,
        host: &mut dyn WorldHost,
        target: Self::Decision,
    ) -> Result<ApplyReport, PhaseError> {
        let Some(target) = target else {
            return Ok(ApplyReport::default());
        };
        host.apply_world(WorldMutation::SetHorizons {
            view: target.view,
            simulation: target.simulation,
        })?;
        let mut state = self.state.lock();
        state.current = Some(target);
        state.changed_at = self.clock.now_ms();
        tracing::info!(view = target.view, simulation = target.simulation, "horizons changed");
        Ok(ApplyReport {
            applied: 1,
            ..ApplyReport::default()
        })
    }

    fn is_noop(&self, target: &Self::Decision) -> bool {
        target.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballast_common::ManualClock;
    use ballast_pipeline::{Executor, PhaseRunner};
    use ballast_sim::SimWorld;
    use ballast_telemetry::scale_from_mspt;

    fn controller() -> HorizonController {
        HorizonController::new(
            HorizonConfig::default(),
            Arc::new(ManualClock::new(0)),
            ScaleReader::fixed_mspt(20.0),
        )
    }

    #[test]
    fn targets_follow_scale_and_trend() {
        let h = controller();
        assert_eq!(h.target(1.0, 0.0), Horizons { view: 10, simulation: 8 });
        assert_eq!(h.target(0.0, 0.0), Horizons { view: 6, simulation: 4 });
        assert_eq!(h.target(1.0, 6.0), Horizons { view: 6, simulation: 4 });
        assert_eq!(h.target(1.0, 3.0), Horizons { view: 9, simulation: 7 });
        assert_eq!(h.target(0.0, 3.0), Horizons { view: 5, simulation: 3 });
    }

    fn sample(mspt: f64, velocity: f64) -> ScaleSample {
        ScaleSample {
            raw_mspt: mspt,
            smoothed_mspt: mspt,
            scale: scale_from_mspt(mspt),
            velocity,
        }
    }

    #[test]
    fn growth_waits_for_cooldown_but_shrinking_does_not() {
        let h = controller();
        let at = |now, s| HorizonInput { now, sample: s };

        // First decision always applies.
        let first = h.compute(at(0, sample(60.0, 6.0))).unwrap();
        assert_eq!(first, Some(Horizons { view: 6, simulation: 4 }));
        {
            let mut state = h.state.lock();
            state.current = first;
            state.changed_at = 0;
        }
        assert_eq!(h.compute(at(10_000, sample(0.0, 0.0))).unwrap(), None);
        assert!(h.compute(at(30_000, sample(0.0, 0.0))).unwrap().is_some());

        {
            let mut state = h.state.lock();
            state.current = Some(Horizons { view: 10, simulation: 8 });
            state.changed_at = 29_000;
        }
        let shrink = h.compute(at(30_000, sample(0.0, 6.0))).unwrap();
        assert_eq!(shrink, Some(Horizons { view: 6, simulation: 4 }));
    }

    #[test]
    fn cycle_sets_host_horizons() {
        let clock = Arc::new(ManualClock::new(0));
        let h = Arc::new(HorizonController::new(
            HorizonConfig::default(),
            clock,
            ScaleReader::fixed(sample(200.0, 0.0)),
        ));
        let runner = PhaseRunner::new(Arc::clone(&h), Executor::new(1).unwrap());
        let mut world = SimWorld::new();
        runner.run_inline(&mut world).unwrap();
        assert_eq!(world.horizons(), (6, 4));
        assert_eq!(h.current(), Some(Horizons { view: 6, simulation: 4 }));
        let again = runner.run_inline(&mut world).unwrap();
        assert_eq!(again.applied, 0);
    }
}
