use std::collections::{BTreeMap, BTreeSet};

use ballast_common::{
    HostError, ItemStack, Mutation, MutationOutcome, ObjectFilter, ObjectFlags, ObjectId,
    ObjectKind, ObjectSnapshot, PlayerView, RegionId, SnapshotDetail, SpatialKey, WorldHost,
    WorldMutation,
};
use glam::DVec3;

/// An event record produced by every host call that changes the world.
///
/// Tests and the CLI read the log to see exactly what the controller did.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    Spawned { id: ObjectId, kind: ObjectKind },
    Removed { id: ObjectId },
    Mutated { id: ObjectId, mutation: Mutation },
    World(WorldMutation),
    Broadcast(String),
    Saved,
    Disconnected { reason: String },
    Shutdown,
    Stepped { tick: u64 },
}

/// Per-object state stored in the world.
#[derive(Debug, Clone, PartialEq)]
pub struct SimObject {
    pub kind: ObjectKind,
    pub region: RegionId,
    pub position: DVec3,
    pub velocity: DVec3,
    pub flags: ObjectFlags,
    pub autonomous: bool,
    pub has_target: bool,
    pub age_ms: u64,
    pub item: Option<ItemStack>,
    pub experience: u32,
    /// Viewers this object is hidden from.
    pub hidden_from: BTreeSet<ObjectId>,
}

impl SimObject {
    pub fn new(kind: ObjectKind, region: RegionId, position: DVec3) -> Self {
        Self {
            kind,
            region,
            position,
            velocity: DVec3::ZERO,
            flags: ObjectFlags::default(),
            autonomous: true,
            has_target: false,
            age_ms: 0,
            item: None,
            experience: 0,
            hidden_from: BTreeSet::new(),
        }
    }

    fn snapshot(&self, id: ObjectId) -> ObjectSnapshot {
        let detail = match (&self.item, self.kind) {
            (Some(stack), _) => SnapshotDetail::Item {
                stack: stack.clone(),
                age_ms: self.age_ms,
            },
            (None, ObjectKind::ExperienceOrb) => SnapshotDetail::Orb {
                experience: self.experience,
            },
            _ => SnapshotDetail::Entity {
                has_target: self.has_target,
                autonomous: self.autonomous,
                velocity_sq: self.velocity.length_squared(),
                age_ms: self.age_ms,
            },
        };
        ObjectSnapshot::new(id, self.kind, self.region.clone(), self.position)
            .with_flags(self.flags)
            .with_detail(detail)
    }
}

/// The reference host.
///
/// Objects live in a BTreeMap so enumeration order is deterministic. Every
/// mutation goes through [`WorldHost`] and lands in the event log.
#[derive(Debug, Clone)]
pub struct SimWorld {
    objects: BTreeMap<ObjectId, SimObject>,
    players: BTreeMap<ObjectId, PlayerView>,
    tick: u64,
    tick_ms: u64,
    horizons: (u32, u32),
    shut_down: bool,
    /// Reject every object mutation except removal.
    rejecting: bool,
    event_log: Vec<HostEvent>,
}

impl Default for SimWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl SimWorld {
    /// Empty world at tick 0 advancing 50ms per step.
    pub fn new() -> Self {
        Self {
            objects: BTreeMap::new(),
            players: BTreeMap::new(),
            tick: 0,
            tick_ms: 50,
            horizons: (10, 8),
            shut_down: false,
            rejecting: false,
            event_log: Vec::new(),
        }
    }

    /// Make object mutations fail with `HostError::Rejected` until reset.
    pub fn set_rejecting(&mut self, rejecting: bool) {
        self.rejecting = rejecting;
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn tick_ms(&self) -> u64 {
        self.tick_ms
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn count_kind(&self, kind: ObjectKind) -> usize {
        self.objects.values().filter(|o| o.kind == kind).count()
    }

    pub fn objects(&self) -> &BTreeMap<ObjectId, SimObject> {
        &self.objects
    }

    pub fn get(&self, id: ObjectId) -> Option<&SimObject> {
        self.objects.get(&id)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut SimObject> {
        self.objects.get_mut(&id)
    }

    pub fn insert(&mut self, object: SimObject) -> ObjectId {
        let id = ObjectId::new();
        self.event_log.push(HostEvent::Spawned {
            id,
            kind: object.kind,
        });
        self.objects.insert(id, object);
        id
    }

    pub fn spawn(&mut self, kind: ObjectKind, region: RegionId, position: DVec3) -> ObjectId {
        self.insert(SimObject::new(kind, region, position))
    }

    pub fn spawn_item(&mut self, region: RegionId, position: DVec3, stack: ItemStack) -> ObjectId {
        let mut object = SimObject::new(ObjectKind::Item, region, position);
        object.item = Some(stack);
        self.insert(object)
    }

    pub fn spawn_orb(&mut self, region: RegionId, position: DVec3, experience: u32) -> ObjectId {
        let mut object = SimObject::new(ObjectKind::ExperienceOrb, region, position);
        object.experience = experience;
        self.insert(object)
    }

    /// Remove an object outside the controller, e.g. killed by the game.
    pub fn despawn(&mut self, id: ObjectId) -> Option<SimObject> {
        let removed = self.objects.remove(&id);
        if removed.is_some() {
            self.event_log.push(HostEvent::Removed { id });
        }
        removed
    }

    pub fn add_player(&mut self, name: &str, region: RegionId, position: DVec3) -> ObjectId {
        let id = ObjectId::new();
        self.players.insert(
            id,
            PlayerView {
                id,
                name: name.to_string(),
                region,
                position,
            },
        );
        id
    }

    pub fn move_player(&mut self, id: ObjectId, position: DVec3) -> bool {
        match self.players.get_mut(&id) {
            Some(p) => {
                p.position = position;
                true
            }
            None => false,
        }
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Advance one cycle: age every object and integrate velocity.
    pub fn step(&mut self) {
        self.tick += 1;
        for object in self.objects.values_mut() {
            object.age_ms += self.tick_ms;
            object.position += object.velocity;
        }
        self.event_log.push(HostEvent::Stepped { tick: self.tick });
    }

    pub fn events(&self) -> &[HostEvent] {
        &self.event_log
    }

    pub fn drain_events(&mut self) -> Vec<HostEvent> {
        std::mem::take(&mut self.event_log)
    }

    pub fn broadcasts(&self) -> Vec<String> {
        self.event_log
            .iter()
            .filter_map(|e| match e {
                HostEvent::Broadcast(msg) => Some(msg.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn refreshed_cells(&self) -> Vec<SpatialKey> {
        self.event_log
            .iter()
            .filter_map(|e| match e {
                HostEvent::World(WorldMutation::RefreshCell(key)) => Some(key.clone()),
                _ => None,
            })
            .collect()
    }

    /// (view, simulation) horizons last set.
    pub fn horizons(&self) -> (u32, u32) {
        self.horizons
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

impl WorldHost for SimWorld {
    fn enumerate(&self, filter: &ObjectFilter) -> Vec<ObjectSnapshot> {
        let limit = filter.limit.unwrap_or(usize::MAX);
        self.objects
            .iter()
            .filter(|(_, o)| filter.matches(o.kind, &o.region))
            .take(limit)
            .map(|(id, o)| o.snapshot(*id))
            .collect()
    }

    fn players(&self) -> Vec<PlayerView> {
        self.players.values().cloned().collect()
    }

    fn is_alive(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    fn apply(&mut self, id: ObjectId, mutation: Mutation) -> Result<MutationOutcome, HostError> {
        if mutation == Mutation::Remove {
            return match self.objects.remove(&id) {
                Some(_) => {
                    self.event_log.push(HostEvent::Removed { id });
                    Ok(MutationOutcome::Applied)
                }
                None => Err(HostError::NotFound(id)),
            };
        }
        let object = self.objects.get_mut(&id).ok_or(HostError::NotFound(id))?;
        if self.rejecting {
            return Err(HostError::Rejected(format!("{mutation:?} while busy")));
        }
        let outcome = match &mutation {
            Mutation::Remove => MutationOutcome::Applied,
            Mutation::SetAutonomous(enabled) => {
                let previous = object.autonomous;
                object.autonomous = *enabled;
                MutationOutcome::PreviousAutonomous(previous)
            }
            Mutation::ClearTarget => {
                object.has_target = false;
                MutationOutcome::Applied
            }
            Mutation::ZeroVelocity => {
                object.velocity = DVec3::ZERO;
                MutationOutcome::Applied
            }
            Mutation::SetItemAmount(amount) => {
                let stack = object
                    .item
                    .as_mut()
                    .ok_or_else(|| HostError::Rejected("not an item".into()))?;
                stack.amount = *amount;
                MutationOutcome::Applied
            }
            Mutation::SetExperience(xp) => {
                if object.kind != ObjectKind::ExperienceOrb {
                    return Err(HostError::Rejected("not an experience orb".into()));
                }
                object.experience = *xp;
                MutationOutcome::Applied
            }
            Mutation::SetVisibility { viewer, visible } => {
                if *visible {
                    object.hidden_from.remove(viewer);
                } else {
                    object.hidden_from.insert(*viewer);
                }
                MutationOutcome::Applied
            }
        };
        self.event_log.push(HostEvent::Mutated { id, mutation });
        Ok(outcome)
    }

    fn apply_world(&mut self, mutation: WorldMutation) -> Result<(), HostError> {
        if let WorldMutation::SetHorizons { view, simulation } = mutation {
            self.horizons = (view, simulation);
        }
        self.event_log.push(HostEvent::World(mutation));
        Ok(())
    }

    fn broadcast(&mut self, message: &str) {
        tracing::info!(%message, "broadcast");
        self.event_log.push(HostEvent::Broadcast(message.to_string()));
    }

    fn save_all(&mut self) -> Result<(), HostError> {
        self.event_log.push(HostEvent::Saved);
        Ok(())
    }

    fn disconnect_all(&mut self, reason: &str) {
        self.players.clear();
        self.event_log.push(HostEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    fn shutdown_host(&mut self) {
        self.shut_down = true;
        self.event_log.push(HostEvent::Shutdown);
    }
}
