use std::hint::black_box;
use std::time::Instant;

use ballast_common::{ItemStack, ObjectId, ObjectKind, ObjectSnapshot, RegionId, SnapshotDetail, SpatialKey};
use ballast_shed::merge::plan_item_merges;
use ballast_shed::{CullPolicy, CullTracker, MergeConfig, SnapshotGrid, plan_crowding};
use glam::DVec3;

fn make_mobs(count: usize, spacing: f64) -> Vec<ObjectSnapshot> {
    let side = (count as f64).sqrt().ceil() as usize;
    (0..count)
        .map(|i| {
            let x = (i % side) as f64 * spacing;
            let z = (i / side) as f64 * spacing;
            ObjectSnapshot::new(ObjectId::new(), ObjectKind::Mob, RegionId::default(), DVec3::new(x, 64.0, z))
        })
        .collect()
}

fn make_items(count: usize, spacing: f64) -> Vec<ObjectSnapshot> {
    make_mobs(count, spacing)
        .into_iter()
        .map(|mut s| {
            s.kind = ObjectKind::Item;
            s.with_detail(SnapshotDetail::Item {
                stack: ItemStack::new("stone", 1, 64),
                age_ms: 0,
            })
        })
        .collect()
}

fn bench_grid_build(count: usize, iterations: usize) {
    let snaps = make_mobs(count, 1.0);
    let start = Instant::now();
    for _ in 0..iterations {
        let _ = black_box(SnapshotGrid::build(black_box(&snaps), 4.0));
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / iterations as u32;
    println!("  grid build ({count} objects, {iterations} iters): {per_iter:?}/iter, total {elapsed:?}");
}

fn bench_crowding(count: usize, spacing: f64, iterations: usize) {
    let snaps = make_mobs(count, spacing);
    let start = Instant::now();
    for _ in 0..iterations {
        let _ = black_box(plan_crowding(black_box(&snaps), 2.0, 16));
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / iterations as u32;
    println!(
        "  crowding ({count} objects, spacing {spacing}, {iterations} iters): {per_iter:?}/iter, total {elapsed:?}"
    );
}

fn bench_tracker_scan(keys: usize, iterations: usize) {
    let mut tracker = CullTracker::new(CullPolicy::default(), 10);
    for t in 0..4_000u64 {
        let k = (t as usize * 7) % keys;
        let key = SpatialKey::at(k as i32, 64, (k / 64) as i32);
        tracker.record(&key, 1, t);
    }
    let start = Instant::now();
    for i in 0..iterations {
        let _ = black_box(tracker.scan(black_box(4_000 + i as u64)));
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / iterations as u32;
    println!("  tracker scan ({keys} keys, {iterations} iters): {per_iter:?}/iter, total {elapsed:?}");
}

fn bench_merge_plan(count: usize, iterations: usize) {
    let items = make_items(count, 0.5);
    let config = MergeConfig::default();
    let start = Instant::now();
    for _ in 0..iterations {
        let _ = black_box(plan_item_merges(black_box(&items), &[], &config));
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / iterations as u32;
    println!("  merge plan ({count} items, {iterations} iters): {per_iter:?}/iter, total {elapsed:?}");
}

fn main() {
    println!("=== Shed Compute Benchmarks ===\n");

    println!("Snapshot grid:");
    bench_grid_build(100, 1000);
    bench_grid_build(1000, 100);
    bench_grid_build(10000, 10);

    println!("\nCrowding plan:");
    bench_crowding(500, 0.3, 100);
    bench_crowding(500, 3.0, 100);
    bench_crowding(5000, 0.3, 10);

    println!("\nCull tracker scan:");
    bench_tracker_scan(100, 1000);
    bench_tracker_scan(2000, 100);

    println!("\nItem merge plan:");
    bench_merge_plan(1000, 100);
    bench_merge_plan(5000, 10);

    println!("\n=== Done ===");
}
