use ahash::AHashMap;
use ballast_common::{ObjectSnapshot, RegionId};
use glam::DVec3;

/// A 2D cell coordinate of the partition (the Y axis is ignored).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellCoord {
    pub x: i32,
    pub z: i32,
}

impl CellCoord {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }
}

/// Fixed-size XZ partition of a snapshot batch.
///
/// Stores indices into the slice it was built from, bucketed per region and
/// cell, so neighbour queries during compute touch only nearby objects.
pub struct SnapshotGrid {
    cell_size: f64,
    cells: AHashMap<(RegionId, CellCoord), Vec<usize>>,
}

impl SnapshotGrid {
    /// Non-positive or non-finite sizes fall back to 1.0.
    pub fn new(cell_size: f64) -> Self {
        let cell_size = if cell_size.is_finite() && cell_size > 0.0 {
            cell_size
        } else {
            1.0
        };
        Self {
            cell_size,
            cells: AHashMap::new(),
        }
    }

    pub fn build(snapshots: &[ObjectSnapshot], cell_size: f64) -> Self {
        let mut grid = Self::new(cell_size);
        grid.rebuild(snapshots);
        grid
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    pub fn rebuild(&mut self, snapshots: &[ObjectSnapshot]) {
        self.cells.clear();
        for (index, snapshot) in snapshots.iter().enumerate() {
            let coord = self.position_to_cell(snapshot.position);
            self.cells
                .entry((snapshot.region.clone(), coord))
                .or_default()
                .push(index);
        }
    }

    pub fn position_to_cell(&self, pos: DVec3) -> CellCoord {
        CellCoord {
            x: (pos.x / self.cell_size).floor() as i32,
            z: (pos.z / self.cell_size).floor() as i32,
        }
    }

    pub fn indices_in_cell(&self, region: &RegionId, coord: CellCoord) -> &[usize] {
        self.cells
            .get(&(region.clone(), coord))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Indices of every snapshot within `radius` of `center`, in ascending
    /// index order.
    pub fn within(
        &self,
        snapshots: &[ObjectSnapshot],
        region: &RegionId,
        center: DVec3,
        radius: f64,
    ) -> Vec<usize> {
        let radius_sq = radius * radius;
        let reach = (radius / self.cell_size).ceil().max(0.0) as i32;
        let origin = self.position_to_cell(center);
        let mut found = Vec::new();
        for dx in -reach..=reach {
            for dz in -reach..=reach {
                let coord = CellCoord::new(origin.x + dx, origin.z + dz);
                for &index in self.indices_in_cell(region, coord) {
                    if snapshots[index].position.distance_squared(center) <= radius_sq {
                        found.push(index);
                    }
                }
            }
        }
        found.sort_unstable();
        found
    }

    /// Number of non-empty cells.
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn total_placements(&self) -> usize {
        self.cells.values().map(Vec::len).sum()
    }
}
