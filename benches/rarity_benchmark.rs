//! Aggregation and ranking throughput on a synthetic 10k collection
//!
//! Eight attribute names with skewed value distributions, so the frequency
//! table has a realistic mix of common and one-off values.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rarity_sync::domain::frequency::aggregate;
use rarity_sync::domain::item::{Attribute, Item, TokenId};
use rarity_sync::domain::scoring::{ScoringStrategyKind, rank};

fn synthetic_collection(size: u64) -> Vec<Item> {
    (0..size)
        .map(|token| {
            let attributes = (0..8u64)
                .map(|slot| {
                    // value cardinality grows with the slot index
                    let cardinality = 2 + slot * slot * 3;
                    let value = (token * (slot + 7) + token / (slot + 1)) % cardinality;
                    Attribute::new(format!("trait_{slot}"), format!("value_{value}"))
                })
                .collect();
            Item::new(format!("asset-{token}"), TokenId::from(token), attributes)
        })
        .collect()
}

fn rarity_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("rarity");

    for size in [1_000u64, 10_000] {
        let items = synthetic_collection(size);

        group.bench_with_input(BenchmarkId::new("aggregate", size), &items, |b, items| {
            b.iter(|| black_box(aggregate(items)));
        });

        let table = aggregate(&items);
        for kind in [ScoringStrategyKind::TraitSum, ScoringStrategyKind::Statistical] {
            let strategy = kind.build();
            group.bench_with_input(
                BenchmarkId::new(format!("rank_{kind}"), size),
                &items,
                |b, items| {
                    b.iter(|| black_box(rank(items, &table, strategy.as_ref())));
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, rarity_pipeline);
criterion_main!(benches);
