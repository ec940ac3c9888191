use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use ahash::AHashSet;
use glam::DVec3;
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const DEFAULT_REGION: &str = "world";

fn interner() -> &'static Mutex<AHashSet<Arc<str>>> {
    static INTERNER: OnceLock<Mutex<AHashSet<Arc<str>>>> = OnceLock::new();
    INTERNER.get_or_init(|| Mutex::new(AHashSet::new()))
}

/// Interned name of a world or region.
///
/// Two ids with the same name share one allocation, so comparison is usually
/// a pointer check.
#[derive(Clone)]
pub struct RegionId(Arc<str>);

impl RegionId {
    pub fn intern(name: &str) -> Self {
        let mut set = interner().lock();
        if let Some(existing) = set.get(name) {
            return Self(Arc::clone(existing));
        }
        let shared: Arc<str> = Arc::from(name);
        set.insert(Arc::clone(&shared));
        Self(shared)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Java-style string hash, stable across runs.
    fn stable_hash(&self) -> i32 {
        self.0
            .chars()
            .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(c as i32))
    }
}

impl Default for RegionId {
    fn default() -> Self {
        Self::intern(DEFAULT_REGION)
    }
}

impl PartialEq for RegionId {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || *self.0 == *other.0
    }
}

impl Eq for RegionId {}

impl Hash for RegionId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl PartialOrd for RegionId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RegionId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Debug for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegionId({:?})", &*self.0)
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for RegionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RegionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::intern(&name))
    }
}

/// Integer cell address inside a region.
///
/// Immutable. The hash is computed once at construction and reused by every
/// map lookup.
#[derive(Clone)]
pub struct SpatialKey {
    x: i32,
    y: i32,
    z: i32,
    region: RegionId,
    hash: i32,
}

impl SpatialKey {
    pub fn new(region: RegionId, x: i32, y: i32, z: i32) -> Self {
        let mut h = x;
        h = h.wrapping_mul(31).wrapping_add(y);
        h = h.wrapping_mul(31).wrapping_add(z);
        h = h.wrapping_mul(31).wrapping_add(region.stable_hash());
        Self {
            x,
            y,
            z,
            region,
            hash: h,
        }
    }

    /// Key in the default region.
    pub fn at(x: i32, y: i32, z: i32) -> Self {
        Self::new(RegionId::default(), x, y, z)
    }

    pub fn in_region(name: &str, x: i32, y: i32, z: i32) -> Self {
        Self::new(RegionId::intern(name), x, y, z)
    }

    /// Cell containing a world position.
    pub fn from_position(region: RegionId, position: DVec3) -> Self {
        Self::new(
            region,
            position.x.floor() as i32,
            position.y.floor() as i32,
            position.z.floor() as i32,
        )
    }

    pub fn x(&self) -> i32 {
        self.x
    }

    pub fn y(&self) -> i32 {
        self.y
    }

    pub fn z(&self) -> i32 {
        self.z
    }

    pub fn region(&self) -> &RegionId {
        &self.region
    }

    pub fn offset(&self, dx: i32, dy: i32, dz: i32) -> Self {
        Self::new(
            self.region.clone(),
            self.x.wrapping_add(dx),
            self.y.wrapping_add(dy),
            self.z.wrapping_add(dz),
        )
    }

    /// Every key within the given per-axis extents, self included.
    pub fn neighbourhood(&self, rx: i32, ry: i32, rz: i32) -> Vec<SpatialKey> {
        let mut keys = Vec::with_capacity(((2 * rx + 1) * (2 * ry + 1) * (2 * rz + 1)) as usize);
        for dx in -rx..=rx {
            for dy in -ry..=ry {
                for dz in -rz..=rz {
                    keys.push(self.offset(dx, dy, dz));
                }
            }
        }
        keys
    }

    /// Center of the cell in world coordinates.
    pub fn center(&self) -> DVec3 {
        DVec3::new(
            self.x as f64 + 0.5,
            self.y as f64 + 0.5,
            self.z as f64 + 0.5,
        )
    }
}

impl PartialEq for SpatialKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.x == other.x
            && self.y == other.y
            && self.z == other.z
            && self.region == other.region
    }
}

impl Eq for SpatialKey {}

impl Hash for SpatialKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_i32(self.hash);
    }
}

impl fmt::Debug for SpatialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpatialKey({} {},{},{})", self.region, self.x, self.y, self.z)
    }
}

impl fmt::Display for SpatialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {}, {})", self.region, self.x, self.y, self.z)
    }
}
