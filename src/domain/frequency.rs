//! Attribute frequency aggregation
//!
//! Counts every `(name, value)` pair over a collection snapshot. Percentages
//! and inverse-frequency scores are only derived once all items are counted.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::domain::item::Item;

/// Occurrence statistics for one attribute value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeStat {
    pub count: u64,
    /// `count / total_items * 100`, unrounded.
    pub percentage: f64,
    /// Inverse frequency, `total_items / count`.
    pub rarity_score: f64,
}

impl AttributeStat {
    fn new(count: u64, total_items: u64) -> Self {
        let total = total_items as f64;
        let count_f = count as f64;
        Self {
            count,
            percentage: count_f / total * 100.0,
            rarity_score: total / count_f,
        }
    }

    /// Percentage rounded to two decimals, as stored and reported.
    pub fn rounded_percentage(&self) -> f64 {
        (self.percentage * 100.0).round() / 100.0
    }
}

/// `name -> value -> stat`, built once per run and read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollectionFrequencyTable {
    total_items: u64,
    stats: BTreeMap<String, BTreeMap<String, AttributeStat>>,
}

impl CollectionFrequencyTable {
    pub const fn total_items(&self) -> u64 {
        self.total_items
    }

    pub fn get(&self, name: &str, value: &str) -> Option<&AttributeStat> {
        self.stats.get(name).and_then(|values| values.get(value))
    }

    pub fn values_of(&self, name: &str) -> Option<&BTreeMap<String, AttributeStat>> {
        self.stats.get(name)
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.stats.keys().map(String::as_str)
    }

    /// Iterate `(name, value, stat)` in name/value order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &AttributeStat)> {
        self.stats.iter().flat_map(|(name, values)| {
            values
                .iter()
                .map(move |(value, stat)| (name.as_str(), value.as_str(), stat))
        })
    }

    /// Number of distinct `(name, value)` pairs.
    pub fn len(&self) -> usize {
        self.stats.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

/// Build the frequency table for a snapshot. Empty input yields an empty table.
pub fn aggregate(items: &[Item]) -> CollectionFrequencyTable {
    let mut counts: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();

    for item in items {
        for attribute in &item.attributes {
            if attribute.name.is_empty() || attribute.value.is_empty() {
                continue;
            }
            *counts
                .entry(attribute.name.clone())
                .or_default()
                .entry(attribute.value.clone())
                .or_default() += 1;
        }
    }

    let total_items = items.len() as u64;
    let stats = counts
        .into_iter()
        .map(|(name, values)| {
            let values = values
                .into_iter()
                .map(|(value, count)| (value, AttributeStat::new(count, total_items)))
                .collect();
            (name, values)
        })
        .collect();

    CollectionFrequencyTable { total_items, stats }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::item::{Attribute, AttributeSet, TokenId};
    use proptest::prelude::*;

    fn item(token: u64, attrs: &[(&str, &str)]) -> Item {
        Item::new(
            format!("asset-{token}"),
            TokenId::from(token),
            attrs.iter().map(|(n, v)| Attribute::new(*n, *v)).collect(),
        )
    }

    #[test]
    fn three_item_example() {
        let items = vec![
            item(1, &[("color", "red")]),
            item(2, &[("color", "red")]),
            item(3, &[("color", "blue")]),
        ];
        let table = aggregate(&items);

        let red = table.get("color", "red").unwrap();
        assert_eq!(red.count, 2);
        assert!((red.rounded_percentage() - 66.67).abs() < f64::EPSILON);
        assert!((red.rarity_score - 1.5).abs() < 1e-12);

        let blue = table.get("color", "blue").unwrap();
        assert_eq!(blue.count, 1);
        assert!((blue.rounded_percentage() - 33.33).abs() < f64::EPSILON);
        assert!((blue.rarity_score - 3.0).abs() < 1e-12);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn empty_snapshot_gives_empty_table() {
        let table = aggregate(&[]);
        assert!(table.is_empty());
        assert_eq!(table.total_items(), 0);
    }

    #[test]
    fn empty_names_and_values_are_ignored() {
        let mut attributes = AttributeSet::new();
        attributes.insert(Attribute::new("", "x"));
        attributes.insert(Attribute::new("hat", ""));
        attributes.insert(Attribute::new("hat", "cap"));
        let items = vec![Item::new("a", TokenId::from(1), attributes)];

        let table = aggregate(&items);
        assert_eq!(table.len(), 1);
        assert_eq!(table.attribute_names().collect::<Vec<_>>(), vec!["hat"]);
    }

    proptest! {
        #[test]
        fn counts_bounded_and_percentages_in_range(
            raw in proptest::collection::vec(
                proptest::collection::vec((0u8..4, 0u8..5), 0..4),
                0..60,
            )
        ) {
            let items: Vec<Item> = raw
                .iter()
                .enumerate()
                .map(|(i, attrs)| Item::new(
                    i.to_string(),
                    TokenId::from(i as u64),
                    attrs.iter().map(|(n, v)| Attribute::new(format!("n{n}"), format!("v{v}"))).collect(),
                ))
                .collect();
            let table = aggregate(&items);

            for name in table.attribute_names() {
                let sum: u64 = table.values_of(name).unwrap().values().map(|s| s.count).sum();
                prop_assert!(sum <= items.len() as u64);
            }
            for (_, _, stat) in table.iter() {
                prop_assert!(stat.percentage > 0.0 && stat.percentage <= 100.0);
                prop_assert!(stat.rarity_score >= 1.0);
            }
        }
    }
}
