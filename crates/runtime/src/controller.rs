use std::collections::BTreeMap;
use std::sync::Arc;

use ballast_common::{
    Clock, MonotonicClock, NoTiming, ObjectId, ObjectKind, PlayerView, RegionId, SpatialKey,
    TimingSource, WorldHost, WorldMutation,
};
use ballast_pipeline::{
    ApplyReport, Domain, PhaseRunner, Scheduler, SchedulerError, TaskHandle,
};
use ballast_safety::{SafetyPhase, SafetyService};
use ballast_shed::{
    AiSimplifier, DeviceCulling, DeviceExpiry, EntityDensity, ExplosionEvent, ExplosionThrottle,
    ExplosionVerdict, HorizonController, Horizons, ItemMerge, ItemVisibility, ParticleCulling,
    Primer, ProjectileCleanup, RecentActionTracker, ThroughputLimiter, TransferRequest,
    TransferVerdict,
};
use ballast_telemetry::{LoadScaleEngine, SubscriberHandle, SubscriberRegistry, TickTelemetry};
use glam::DVec3;
use parking_lot::Mutex;

use crate::config::{ConfigError, ControllerConfig};
use crate::debug::DebugState;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("controller is already running")]
    AlreadyRunning,
}

/// Every subsystem, shared with the periodic tasks.
struct Subsystems {
    engine: Arc<LoadScaleEngine>,
    recent: Arc<RecentActionTracker>,
    device: PhaseRunner<DeviceCulling>,
    device_expiry: PhaseRunner<DeviceExpiry>,
    particle: PhaseRunner<ParticleCulling>,
    density: PhaseRunner<EntityDensity>,
    ai: PhaseRunner<AiSimplifier>,
    projectile: PhaseRunner<ProjectileCleanup>,
    visibility: PhaseRunner<ItemVisibility>,
    merge: PhaseRunner<ItemMerge>,
    horizon: PhaseRunner<HorizonController>,
    explosion: Arc<ExplosionThrottle>,
    throughput: Arc<ThroughputLimiter>,
    safety: Arc<SafetyService>,
}

impl Subsystems {
    fn statistics(&self) -> BTreeMap<String, i64> {
        let device = self.device.domain().stats();
        let particle = self.particle.domain().stats();
        let entries = [
            ("monitored_locations", device.monitored as i64),
            ("culled_locations", device.culled as i64),
            ("total_tracked", device.monitored as i64),
            ("particle_tracked", particle.monitored as i64),
            ("particle_culled", particle.culled as i64),
            ("cramming_removals", self.density.domain().removed() as i64),
            ("item_merges", self.merge.domain().merged_total() as i64),
            ("ai_simplified", self.ai.domain().simplified_count() as i64),
            ("projectiles_tracked", self.projectile.domain().tracked() as i64),
            ("explosions_cancelled", self.explosion.stats().cancelled as i64),
            ("hopper_limit", self.throughput.limit() as i64),
        ];
        entries
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect()
    }

    fn clear(&self) {
        self.device.domain().clear();
        self.particle.domain().clear();
        self.ai.domain().clear();
        self.projectile.domain().clear();
        self.visibility.domain().clear();
        self.explosion.clear();
        self.throughput.clear();
        self.recent.clear();
    }
}

#[derive(Default)]
struct Lifecycle {
    running: bool,
    tasks: Vec<TaskHandle>,
    subscriptions: Vec<SubscriberHandle>,
}

/// Composition root. Owns every subsystem, starts them in order and stops
/// them in reverse.
///
/// The host drives it through [`Controller::on_cycle`] once per cycle on its
/// mutation thread and forwards its events to the `on_*` hooks, which answer
/// inline.
pub struct Controller {
    config: ControllerConfig,
    scheduler: Arc<Scheduler>,
    debug: Arc<DebugState>,
    parts: Arc<Subsystems>,
    lifecycle: Mutex<Lifecycle>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        clock: Arc<dyn Clock>,
        timing: Arc<dyn TimingSource>,
    ) -> Result<Self, ControllerError> {
        config.validate()?;
        let scheduler = Arc::new(Scheduler::new(&config.scheduler, Arc::clone(&clock))?);
        let executor = scheduler.executor();

        let telemetry = Arc::new(TickTelemetry::new(config.telemetry.clone(), timing));
        let engine = Arc::new(LoadScaleEngine::new(
            config.scale.clone(),
            telemetry,
            Arc::new(SubscriberRegistry::new()),
        ));
        let reader = engine.reader();
        let recent = Arc::new(RecentActionTracker::new(config.recent.clone(), Arc::clone(&clock)));

        let device = Arc::new(DeviceCulling::new(
            config.device.clone(),
            Arc::clone(&clock),
            reader.clone(),
        ));
        let parts = Subsystems {
            device_expiry: PhaseRunner::new(
                Arc::new(DeviceExpiry::new(Arc::clone(&device))),
                executor.clone(),
            ),
            device: PhaseRunner::new(device, executor.clone()),
            particle: PhaseRunner::new(
                Arc::new(ParticleCulling::new(config.particle.clone(), Arc::clone(&clock))),
                executor.clone(),
            ),
            density: PhaseRunner::new(
                Arc::new(EntityDensity::new(config.density.clone(), reader.clone())),
                executor.clone(),
            ),
            ai: PhaseRunner::new(
                Arc::new(AiSimplifier::new(config.ai.clone(), reader.clone())),
                executor.clone(),
            ),
            projectile: PhaseRunner::new(
                Arc::new(ProjectileCleanup::new(config.projectile.clone(), Arc::clone(&clock))),
                executor.clone(),
            ),
            visibility: PhaseRunner::new(
                Arc::new(ItemVisibility::new(config.visibility.clone(), reader.clone())),
                executor.clone(),
            ),
            merge: PhaseRunner::new(Arc::new(ItemMerge::new(config.merge.clone())), executor.clone()),
            horizon: PhaseRunner::new(
                Arc::new(HorizonController::new(
                    config.horizon.clone(),
                    Arc::clone(&clock),
                    reader.clone(),
                )),
                executor,
            ),
            explosion: Arc::new(ExplosionThrottle::new(
                config.explosion.clone(),
                Arc::clone(&clock),
                reader.clone(),
                Arc::clone(&recent),
            )),
            throughput: Arc::new(ThroughputLimiter::new(
                config.throughput.clone(),
                Arc::clone(&clock),
                Arc::clone(&recent),
            )),
            safety: Arc::new(SafetyService::new(config.safety.clone(), reader)),
            engine,
            recent,
        };

        Ok(Self {
            config,
            scheduler,
            debug: Arc::new(DebugState::new()),
            parts: Arc::new(parts),
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    /// Wall clock and no host timing.
    pub fn standalone(config: ControllerConfig) -> Result<Self, ControllerError> {
        Self::new(config, Arc::new(MonotonicClock::new()), Arc::new(NoTiming))
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn telemetry(&self) -> &Arc<TickTelemetry> {
        self.parts.engine.telemetry()
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.lock().running
    }

    /// Start order: scale subscriptions, scale sampling, domain scans,
    /// maintenance timers, the safety check, the statistics report, then
    /// the timer thread.
    pub fn start(&self) -> Result<(), ControllerError> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.running {
            return Err(ControllerError::AlreadyRunning);
        }
        let _span = tracing::info_span!("controller_start").entered();
        let parts = &self.parts;
        parts.engine.reset_publication();
        parts.safety.reset();

        lifecycle.subscriptions = self.subscribe_operating_points();

        let engine = Arc::clone(&parts.engine);
        let executor = self.scheduler.executor();
        let period = self.config.scale.period_ms;
        lifecycle.tasks.push(self.scheduler.every_async("scale-sample", period, period, move || {
            if let Some(scale) = engine.sample_and_publish(executor.queue()) {
                tracing::debug!(scale, "scale published");
            }
        }));

        let cfg = &self.config;
        let scans = [
            schedule(&self.scheduler, &parts.device, cfg.device.enabled, cfg.device.scan_period_ms),
            schedule(
                &self.scheduler,
                &parts.device_expiry,
                cfg.device.enabled,
                cfg.device.expiry_period_ms,
            ),
            schedule(
                &self.scheduler,
                &parts.particle,
                cfg.particle.enabled,
                cfg.particle.scan_period_ms,
            ),
            schedule(&self.scheduler, &parts.density, cfg.density.enabled, cfg.density.period_ms),
            schedule(&self.scheduler, &parts.ai, cfg.ai.enabled, cfg.ai.period_ms),
            schedule(
                &self.scheduler,
                &parts.projectile,
                cfg.projectile.enabled,
                cfg.projectile.period_ms,
            ),
            schedule(
                &self.scheduler,
                &parts.visibility,
                cfg.visibility.enabled,
                cfg.visibility.period_ms,
            ),
            schedule(&self.scheduler, &parts.merge, cfg.merge.enabled, cfg.merge.period_ms),
            schedule(&self.scheduler, &parts.horizon, cfg.horizon.enabled, cfg.horizon.period_ms),
        ];
        lifecycle.tasks.extend(scans.into_iter().flatten());

        if cfg.throughput.enabled {
            let throughput = Arc::clone(&parts.throughput);
            let period = cfg.throughput.reset_period_ms;
            lifecycle.tasks.push(self.scheduler.every_sync("transfer-reset", period, period, move |_| {
                throughput.reset_counters();
            }));
        }
        if cfg.explosion.enabled {
            let explosion = Arc::clone(&parts.explosion);
            let period = cfg.explosion.window_ms;
            lifecycle.tasks.push(self.scheduler.every_sync("explosion-window", period, period, move |_| {
                explosion.reset_window();
            }));
        }
        let recent = Arc::clone(&parts.recent);
        let period = cfg.recent.sweep_period_ms;
        lifecycle.tasks.push(self.scheduler.every_async("recent-sweep", period, period, move || {
            let swept = recent.sweep();
            if swept > 0 {
                tracing::trace!(swept, "recent actions swept");
            }
        }));

        if let Some(handle) = parts.safety.start(&self.scheduler) {
            lifecycle.tasks.push(handle);
        }

        if cfg.stats_period_ms > 0 {
            let parts = Arc::clone(&self.parts);
            let debug = Arc::clone(&self.debug);
            let period = cfg.stats_period_ms;
            lifecycle.tasks.push(self.scheduler.every_async("stats-report", period, period, move || {
                report_statistics(&parts, &debug);
            }));
        }

        if let Err(err) = self.scheduler.start() {
            for handle in lifecycle.tasks.drain(..) {
                self.scheduler.cancel(handle);
            }
            for handle in lifecycle.subscriptions.drain(..) {
                parts.engine.registry().unregister(handle);
            }
            return Err(err.into());
        }
        lifecycle.running = true;
        tracing::info!(timers = lifecycle.tasks.len(), "controller started");
        Ok(())
    }

    fn subscribe_operating_points(&self) -> Vec<SubscriberHandle> {
        let registry = self.parts.engine.registry();
        let device = Arc::clone(self.parts.device.domain());
        let density = Arc::clone(self.parts.density.domain());
        let throughput = Arc::clone(&self.parts.throughput);
        vec![
            registry.register("device-culling", move |scale| device.set_scale(scale)),
            registry.register("entity-density", move |scale| density.set_scale(scale)),
            registry.register("throughput", move |scale| throughput.set_scale(scale)),
        ]
    }

    /// Stop in reverse order: timers and the queue, subscriptions, then the
    /// host-visible state is handed back and every map is cleared.
    pub fn stop(&self, host: &mut dyn WorldHost) -> ApplyReport {
        let mut lifecycle = self.lifecycle.lock();
        if !lifecycle.running {
            return ApplyReport::default();
        }
        let _span = tracing::info_span!("controller_stop").entered();
        self.scheduler.stop();
        lifecycle.tasks.clear();
        let registry = self.parts.engine.registry();
        for handle in lifecycle.subscriptions.drain(..) {
            registry.unregister(handle);
        }

        let parts = &self.parts;
        let mut report = parts.ai.domain().restore_all(host);
        report.merge(parts.visibility.domain().show_all(host));
        for key in parts.device.domain().uncull_all() {
            match host.apply_world(WorldMutation::RefreshCell(key)) {
                Ok(()) => report.applied += 1,
                Err(err) => {
                    tracing::debug!(%err, "refresh on stop failed");
                    report.failed += 1;
                }
            }
        }
        parts.clear();
        lifecycle.running = false;
        tracing::info!(
            restored = report.applied,
            failed = report.failed,
            "controller stopped"
        );
        report
    }

    /// Host cycle boundary: timing, due synchronous timers, queued
    /// mutations. Returns the number of mutation jobs run.
    pub fn on_cycle(&self, host: &mut dyn WorldHost) -> usize {
        self.parts.engine.telemetry().on_cycle();
        self.scheduler.on_cycle(host)
    }

    pub fn scale(&self) -> f64 {
        self.parts.engine.scale()
    }

    pub fn smoothed_mspt(&self) -> f64 {
        self.parts.engine.smoothed_mspt()
    }

    pub fn statistics(&self) -> BTreeMap<String, i64> {
        self.parts.statistics()
    }

    /// Statistics as a JSON object.
    pub fn statistics_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.statistics())
    }

    pub fn safety_phase(&self) -> SafetyPhase {
        self.parts.safety.phase()
    }

    pub fn horizons(&self) -> Option<Horizons> {
        self.parts.horizon.domain().current()
    }

    /// True while device updates at `key` are suppressed.
    pub fn is_key_culled(&self, key: &SpatialKey) -> bool {
        self.parts.device.domain().is_culled(key)
    }

    /// Enable or disable debug reporting on behalf of `owner`.
    pub fn set_debug(&self, enabled: bool, owner: &str) -> bool {
        let now = self.debug.set(enabled, owner);
        tracing::info!(%owner, enabled, active = now, "debug reporting toggled");
        now
    }

    pub fn debug_owners(&self) -> Vec<String> {
        self.debug.owners()
    }

    pub fn is_debug(&self) -> bool {
        self.debug.is_enabled()
    }

    pub fn register_subscriber(
        &self,
        owner: impl Into<String>,
        callback: impl Fn(f64) + Send + Sync + 'static,
    ) -> SubscriberHandle {
        self.parts.engine.registry().register(owner, callback)
    }

    pub fn unregister_subscriber(&self, handle: SubscriberHandle) -> bool {
        self.parts.engine.registry().unregister(handle)
    }

    // Host event hooks. All run inline on the mutation context.

    /// A device at `key` wants to update. True means suppress it.
    pub fn on_device_update(&self, key: &SpatialKey) -> bool {
        self.parts.device.domain().record_update(key)
    }

    /// `count` effects are about to play at `key`. True means suppress them.
    pub fn on_particle(&self, key: &SpatialKey, count: u32) -> bool {
        self.parts.particle.domain().record_effects(key, count)
    }

    pub fn on_explosive_primed(
        &self,
        id: ObjectId,
        key: &SpatialKey,
        primer: Primer,
        players: &[PlayerView],
    ) {
        self.parts.explosion.on_primed(id, key, primer, players);
    }

    /// Decide an explosion. Surviving blasts also feed particle culling.
    pub fn on_explosion(&self, event: ExplosionEvent, players: &[PlayerView]) -> ExplosionVerdict {
        let origin = SpatialKey::from_position(event.region.clone(), event.origin);
        let verdict = self.parts.explosion.on_explosion(event);
        if !verdict.cancel && self.parts.particle.domain().record_explosion(&origin, verdict.blocks.len(), players) {
            tracing::debug!(%origin, "explosion effects culled");
        }
        verdict
    }

    /// True if explosion damage to this object should be cancelled.
    pub fn on_damage(&self, kind: ObjectKind, region: &RegionId, position: DVec3) -> bool {
        self.parts.explosion.should_cancel_damage(kind, region, position)
    }

    pub fn on_transfer(&self, request: &TransferRequest) -> TransferVerdict {
        self.parts.throughput.on_transfer(request)
    }

    /// A player placed a block at `key`.
    pub fn on_block_placed(&self, key: &SpatialKey) {
        self.parts.recent.record_placement(key);
        self.parts.throughput.on_neighbour_changed(key);
    }

    pub fn on_dispense(&self, key: &SpatialKey) {
        self.parts.recent.record_dispense(key);
    }

    /// A player spawned `id`, e.g. from an egg or a placed explosive.
    pub fn on_player_spawn(&self, id: ObjectId) {
        self.parts.recent.record_player_spawn(id);
    }

    pub fn on_projectile_launch(&self, id: ObjectId) {
        self.parts.projectile.domain().on_launch(id);
    }

    pub fn on_projectile_hit(&self, id: ObjectId) {
        self.parts.projectile.domain().forget(id);
    }

    /// Removal or unload of an object.
    pub fn on_object_removed(&self, id: ObjectId) {
        self.parts.ai.domain().forget(id);
        self.parts.visibility.domain().forget(id);
        self.parts.projectile.domain().forget(id);
    }

    /// Drop every per-key entry of `region`, e.g. when it unloads.
    pub fn clear_region(&self, region: &RegionId) {
        let parts = &self.parts;
        parts.device.domain().clear_region(region);
        parts.particle.domain().clear_region(region);
        parts.explosion.clear_region(region);
        parts.throughput.clear_region(region);
        parts.recent.clear_region(region);
        tracing::debug!(%region, "region state cleared");
    }
}

fn schedule<D: Domain>(
    scheduler: &Scheduler,
    runner: &PhaseRunner<D>,
    enabled: bool,
    period_ms: u64,
) -> Option<TaskHandle> {
    if !enabled {
        tracing::info!(domain = runner.domain().name(), "disabled");
        return None;
    }
    Some(runner.schedule(scheduler, period_ms))
}

fn report_statistics(parts: &Subsystems, debug: &DebugState) {
    let stats = parts.statistics();
    let json = match serde_json::to_string(&stats) {
        Ok(json) => json,
        Err(err) => {
            tracing::warn!(%err, "statistics could not be encoded");
            return;
        }
    };
    let scale = parts.engine.scale();
    if debug.is_enabled() {
        tracing::info!(scale, stats = %json, "statistics");
    } else {
        tracing::debug!(scale, stats = %json, "statistics");
    }
}
