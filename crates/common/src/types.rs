use glam::DVec3;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::key::RegionId;

/// Unique identifier for a simulation object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub Uuid);

impl ObjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

/// Coarse category of a simulation object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Player,
    Mob,
    Passive,
    Boss,
    ArmorStand,
    ItemFrame,
    Painting,
    Item,
    ExperienceOrb,
    Projectile,
    Explosive,
    Other,
}

impl ObjectKind {
    /// Background objects that explosion freeze windows protect.
    pub fn is_decorative(self) -> bool {
        matches!(
            self,
            Self::ArmorStand | Self::ItemFrame | Self::Painting | Self::Item | Self::ExperienceOrb
        )
    }

    /// Living objects that take part in crowding.
    pub fn is_crowdable(self) -> bool {
        matches!(self, Self::Mob | Self::Passive)
    }

    /// Objects with autonomous behaviour that can be simplified.
    pub fn has_autonomy(self) -> bool {
        matches!(self, Self::Mob | Self::Passive)
    }
}

/// Per-object flags copied at snapshot time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectFlags {
    /// Carries a custom display name.
    pub named: bool,
    /// Owned by a player.
    pub tamed: bool,
    /// Explicitly tagged as never removable.
    pub keep: bool,
}

/// Item stack contents, as seen at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStack {
    pub material: String,
    pub durability: u32,
    pub amount: u32,
    pub max_stack: u32,
    /// Custom metadata (names, enchantments) blocks merging.
    pub has_meta: bool,
}

impl ItemStack {
    pub fn new(material: impl Into<String>, amount: u32, max_stack: u32) -> Self {
        Self {
            material: material.into(),
            durability: 0,
            amount,
            max_stack,
            has_meta: false,
        }
    }

    /// Same material and durability, neither carrying metadata.
    pub fn stacks_with(&self, other: &ItemStack) -> bool {
        !self.has_meta
            && !other.has_meta
            && self.material == other.material
            && self.durability == other.durability
    }
}

/// Kind-specific payload of an [`ObjectSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SnapshotDetail {
    Entity {
        has_target: bool,
        autonomous: bool,
        velocity_sq: f64,
        age_ms: u64,
    },
    Item {
        stack: ItemStack,
        age_ms: u64,
    },
    Orb {
        experience: u32,
    },
}

impl Default for SnapshotDetail {
    fn default() -> Self {
        Self::Entity {
            has_target: false,
            autonomous: true,
            velocity_sq: 0.0,
            age_ms: 0,
        }
    }
}

/// Immutable per-cycle copy of one simulation object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    pub id: ObjectId,
    pub region: RegionId,
    pub position: DVec3,
    pub kind: ObjectKind,
    pub flags: ObjectFlags,
    /// Derived removal priority: lower is removed first.
    pub worth: i32,
    pub detail: SnapshotDetail,
}

impl ObjectSnapshot {
    pub fn new(id: ObjectId, kind: ObjectKind, region: RegionId, position: DVec3) -> Self {
        let mut snapshot = Self {
            id,
            region,
            position,
            kind,
            flags: ObjectFlags::default(),
            worth: 0,
            detail: SnapshotDetail::default(),
        };
        snapshot.worth = snapshot.derive_worth();
        snapshot
    }

    pub fn with_flags(mut self, flags: ObjectFlags) -> Self {
        self.flags = flags;
        self.worth = self.derive_worth();
        self
    }

    pub fn with_detail(mut self, detail: SnapshotDetail) -> Self {
        self.detail = detail;
        self.worth = self.derive_worth();
        self
    }

    /// Base 50, named +200, orbs 1, items left lying for 30s at most 5.
    fn derive_worth(&self) -> i32 {
        if self.kind == ObjectKind::ExperienceOrb {
            return 1;
        }
        let mut worth = 50;
        if self.flags.named {
            worth += 200;
        }
        if let SnapshotDetail::Item { age_ms, .. } = self.detail {
            if age_ms > 30_000 {
                worth = worth.min(5);
            }
        }
        worth
    }

    pub fn distance_sq(&self, other: &ObjectSnapshot) -> f64 {
        self.position.distance_squared(other.position)
    }

    pub fn item(&self) -> Option<&ItemStack> {
        match &self.detail {
            SnapshotDetail::Item { stack, .. } => Some(stack),
            _ => None,
        }
    }

    pub fn experience(&self) -> Option<u32> {
        match self.detail {
            SnapshotDetail::Orb { experience } => Some(experience),
            _ => None,
        }
    }

    pub fn has_target(&self) -> bool {
        matches!(self.detail, SnapshotDetail::Entity { has_target: true, .. })
    }

    pub fn velocity_sq(&self) -> f64 {
        match self.detail {
            SnapshotDetail::Entity { velocity_sq, .. } => velocity_sq,
            _ => 0.0,
        }
    }
}

/// Position of a connected player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerView {
    pub id: ObjectId,
    pub name: String,
    pub region: RegionId,
    pub position: DVec3,
}

/// True if any player in `region` is within `radius` of `position`.
pub fn any_player_within(
    players: &[PlayerView],
    region: &RegionId,
    position: DVec3,
    radius: f64,
) -> bool {
    let radius_sq = radius * radius;
    players
        .iter()
        .any(|p| p.region == *region && p.position.distance_squared(position) <= radius_sq)
}

/// Squared distance to the closest player in `region`, if any.
pub fn nearest_player_distance_sq(
    players: &[PlayerView],
    region: &RegionId,
    position: DVec3,
) -> Option<f64> {
    players
        .iter()
        .filter(|p| p.region == *region)
        .map(|p| p.position.distance_squared(position))
        .min_by(|a, b| a.total_cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player_at(x: f64, region: &str) -> PlayerView {
        PlayerView {
            id: ObjectId::new(),
            name: "p".into(),
            region: RegionId::intern(region),
            position: DVec3::new(x, 64.0, 0.0),
        }
    }

    #[test]
    fn object_id_uniqueness() {
        assert_ne!(ObjectId::new(), ObjectId::new());
    }

    #[test]
    fn worth_prefers_named_objects() {
        let region = RegionId::default();
        let plain = ObjectSnapshot::new(ObjectId::new(), ObjectKind::Mob, region.clone(), DVec3::ZERO);
        let named = plain.clone().with_flags(ObjectFlags {
            named: true,
            ..ObjectFlags::default()
        });
        assert_eq!(plain.worth, 50);
        assert_eq!(named.worth, 250);
    }

    #[test]
    fn worth_of_orbs_and_old_items() {
        let region = RegionId::default();
        let orb = ObjectSnapshot::new(ObjectId::new(), ObjectKind::ExperienceOrb, region.clone(), DVec3::ZERO);
        assert_eq!(orb.worth, 1);

        let item = ObjectSnapshot::new(ObjectId::new(), ObjectKind::Item, region, DVec3::ZERO)
            .with_detail(SnapshotDetail::Item {
                stack: ItemStack::new("stone", 3, 64),
                age_ms: 45_000,
            });
        assert_eq!(item.worth, 5);
    }

    #[test]
    fn stacks_with_requires_matching_plain_items() {
        let a = ItemStack::new("stone", 10, 64);
        let mut b = ItemStack::new("stone", 5, 64);
        assert!(a.stacks_with(&b));
        b.has_meta = true;
        assert!(!a.stacks_with(&b));
        assert!(!a.stacks_with(&ItemStack::new("dirt", 1, 64)));
    }

    #[test]
    fn player_proximity_respects_region() {
        let players = vec![player_at(10.0, "world"), player_at(1.0, "nether")];
        let world = RegionId::intern("world");
        let origin = DVec3::new(0.0, 64.0, 0.0);
        assert!(any_player_within(&players, &world, origin, 16.0));
        assert!(!any_player_within(&players, &world, origin, 5.0));
        assert_eq!(nearest_player_distance_sq(&players, &world, origin), Some(100.0));
        assert_eq!(
            nearest_player_distance_sq(&players, &RegionId::intern("end"), origin),
            None
        );
    }
}
