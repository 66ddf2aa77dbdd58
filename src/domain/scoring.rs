//! Rarity scoring strategies and the dense ranker
//!
//! The ranker owns ordering and tie-breaking; the formula is injected through
//! `ScoringStrategy` so alternative rarity models can be swapped in without
//! touching rank assignment.

use std::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::domain::frequency::CollectionFrequencyTable;
use crate::domain::item::{Item, TokenId};

/// Computes a scalar rarity score for one item. Rarer attribute combinations
/// must never score lower than more common ones.
pub trait ScoringStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn score(&self, item: &Item, table: &CollectionFrequencyTable) -> f64;
}

/// Sum of inverse frequencies (`total / count`) of the item's attributes.
/// An item without attributes scores 1.0.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraitSumStrategy;

impl ScoringStrategy for TraitSumStrategy {
    fn name(&self) -> &'static str {
        "trait_sum"
    }

    fn score(&self, item: &Item, table: &CollectionFrequencyTable) -> f64 {
        if item.attributes.is_empty() {
            return 1.0;
        }
        item.attributes
            .iter()
            .filter_map(|a| table.get(&a.name, &a.value))
            .map(|stat| stat.rarity_score)
            .sum()
    }
}

/// Information content: `sum(ln(total / count))`, the log of the product of
/// inverse frequencies. Attributes present on every item contribute nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatisticalRarityStrategy;

impl ScoringStrategy for StatisticalRarityStrategy {
    fn name(&self) -> &'static str {
        "statistical"
    }

    fn score(&self, item: &Item, table: &CollectionFrequencyTable) -> f64 {
        item.attributes
            .iter()
            .filter_map(|a| table.get(&a.name, &a.value))
            .map(|stat| stat.rarity_score.ln())
            .sum()
    }
}

/// Configurable strategy selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringStrategyKind {
    #[default]
    TraitSum,
    Statistical,
}

impl ScoringStrategyKind {
    pub fn build(self) -> Box<dyn ScoringStrategy> {
        match self {
            Self::TraitSum => Box::new(TraitSumStrategy),
            Self::Statistical => Box::new(StatisticalRarityStrategy),
        }
    }
}

impl fmt::Display for ScoringStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.build().name())
    }
}

/// Score and dense rank of one item (rank 1 = rarest).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemRarity {
    pub item_id: String,
    pub token_id: TokenId,
    pub score: f64,
    pub rank: u64,
}

/// Rank every item: score descending, ties broken by ascending token id.
/// Ranks form a bijection onto `1..=items.len()`.
pub fn rank(
    items: &[Item],
    table: &CollectionFrequencyTable,
    strategy: &dyn ScoringStrategy,
) -> Vec<ItemRarity> {
    let mut scored: Vec<(&Item, f64)> = items
        .par_iter()
        // -0.0 would otherwise sort below 0.0 under total ordering
        .map(|item| (item, strategy.score(item, table) + 0.0))
        .collect();

    scored.sort_by(|(a, score_a), (b, score_b)| {
        score_b
            .total_cmp(score_a)
            .then_with(|| a.token_id.cmp(&b.token_id))
    });

    scored
        .into_iter()
        .zip(1u64..)
        .map(|((item, score), rank)| ItemRarity {
            item_id: item.item_id.clone(),
            token_id: item.token_id.clone(),
            score,
            rank,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::frequency::aggregate;
    use crate::domain::item::Attribute;
    use proptest::prelude::*;
    use rstest::rstest;

    fn item(token: u64, attrs: &[(&str, &str)]) -> Item {
        Item::new(
            format!("asset-{token}"),
            TokenId::from(token),
            attrs.iter().map(|(n, v)| Attribute::new(*n, *v)).collect(),
        )
    }

    #[rstest]
    #[case(ScoringStrategyKind::TraitSum)]
    #[case(ScoringStrategyKind::Statistical)]
    fn rarest_item_ranks_first_and_ties_break_by_token(#[case] kind: ScoringStrategyKind) {
        let items = vec![
            item(2, &[("color", "red")]),
            item(1, &[("color", "red")]),
            item(3, &[("color", "blue")]),
        ];
        let table = aggregate(&items);
        let ranked = rank(&items, &table, kind.build().as_ref());

        let order: Vec<(&str, u64)> = ranked
            .iter()
            .map(|r| (r.token_id.as_str(), r.rank))
            .collect();
        assert_eq!(order, vec![("3", 1), ("1", 2), ("2", 3)]);
        assert!((ranked[1].score - ranked[2].score).abs() < f64::EPSILON);
    }

    #[test]
    fn trait_sum_matches_inverse_frequency_sum() {
        let items = vec![
            item(1, &[("color", "red"), ("hat", "cap")]),
            item(2, &[("color", "red")]),
            item(3, &[("color", "blue")]),
            item(4, &[]),
        ];
        let table = aggregate(&items);
        let strategy = TraitSumStrategy;

        // red: 4/2, cap: 4/1
        assert!((strategy.score(&items[0], &table) - 6.0).abs() < 1e-12);
        assert!((strategy.score(&items[3], &table) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn empty_snapshot_ranks_nothing() {
        let table = aggregate(&[]);
        assert!(rank(&[], &table, &TraitSumStrategy).is_empty());
    }

    #[test]
    fn identical_attribute_sets_score_equal() {
        let items = vec![
            item(10, &[("b", "2"), ("a", "1"), ("c", "3")]),
            item(11, &[("c", "3"), ("a", "1"), ("b", "2")]),
            item(12, &[("a", "9")]),
        ];
        let table = aggregate(&items);
        for strategy in [ScoringStrategyKind::TraitSum, ScoringStrategyKind::Statistical] {
            let strategy = strategy.build();
            let a = strategy.score(&items[0], &table);
            let b = strategy.score(&items[1], &table);
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    proptest! {
        #[test]
        fn ranks_are_a_bijection(
            raw in proptest::collection::vec(
                proptest::collection::vec((0u8..3, 0u8..4), 0..3),
                0..80,
            ),
            statistical in any::<bool>(),
        ) {
            let items: Vec<Item> = raw
                .iter()
                .enumerate()
                .map(|(i, attrs)| Item::new(
                    i.to_string(),
                    TokenId::from(i as u64 * 7 % 101),
                    attrs.iter().map(|(n, v)| Attribute::new(format!("n{n}"), format!("v{v}"))).collect(),
                ))
                .collect();
            // token ids above are distinct because 7 and 101 are coprime and i < 101
            let table = aggregate(&items);
            let kind = if statistical { ScoringStrategyKind::Statistical } else { ScoringStrategyKind::TraitSum };
            let ranked = rank(&items, &table, kind.build().as_ref());

            prop_assert_eq!(ranked.len(), items.len());
            let mut ranks: Vec<u64> = ranked.iter().map(|r| r.rank).collect();
            ranks.sort_unstable();
            prop_assert_eq!(ranks, (1..=items.len() as u64).collect::<Vec<_>>());

            for pair in ranked.windows(2) {
                prop_assert!(pair[0].score >= pair[1].score);
                if pair[0].score.to_bits() == pair[1].score.to_bits() {
                    prop_assert!(pair[0].token_id < pair[1].token_id);
                }
            }
        }
    }
}
