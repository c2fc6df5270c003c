//! Listing diff throughput over large snapshots.
//!
//! A busy browse surface carries a few thousand placements per poll, so the
//! diff runs against snapshots of that order.

use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use tracker::listing::diff;
use tracker::records::ListingPlacement;
use tracker::EntityId;

const REGIONS: [&str; 4] = ["NAE", "EU", "ASIA", "BR"];

fn snapshot(panels: usize, per_panel: usize, shift: usize) -> Vec<ListingPlacement> {
    let mut placements = Vec::with_capacity(panels * per_panel * REGIONS.len());
    for panel in 0..panels {
        for region in REGIONS {
            for rank in 0..per_panel {
                let entity = (rank + shift) % (per_panel + shift);
                placements.push(ListingPlacement {
                    surface: "browse".to_string(),
                    panel: format!("panel_{panel:02}"),
                    entity_id: EntityId::parse(&format!("{:04}-0000-{:04}", panel, entity))
                        .expect("valid code"),
                    region: region.to_string(),
                    position: rank as u32,
                });
            }
        }
    }
    placements
}

fn bench_diff(c: &mut Criterion) {
    let at = Utc.with_ymd_and_hms(2026, 9, 1, 18, 0, 0).unwrap();
    let mut group = c.benchmark_group("listing_diff");

    for &(panels, per_panel) in &[(5, 20), (20, 50), (40, 100)] {
        let previous = snapshot(panels, per_panel, 0);
        let current = snapshot(panels, per_panel, 3);
        let size = previous.len();

        group.bench_with_input(BenchmarkId::new("shifted", size), &size, |b, _| {
            b.iter(|| diff(black_box(&previous), black_box(&current), at))
        });
        group.bench_with_input(BenchmarkId::new("unchanged", size), &size, |b, _| {
            b.iter(|| diff(black_box(&previous), black_box(&previous), at))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_diff);
criterion_main!(benches);
