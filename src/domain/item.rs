//! Items, token ids and the raw attribute encoding
//!
//! A collection snapshot arrives as `RawItem` rows straight from the store.
//! `prepare_items` turns them into validated `Item`s, collecting a typed
//! `MalformedItemError` for every row that cannot take part in ranking.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::errors::MalformedItemError;

/// Canonical non-negative integer token id of arbitrary width.
///
/// EVM token ids routinely exceed 64 bits, so the id is kept as a canonical
/// decimal string and ordered numerically (shorter is smaller, then lexical).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(String);

impl TokenId {
    /// Parse a decimal token id. Leading zeros are dropped and an all-zero
    /// fractional part (`"12.0"`, as produced by numeric casts) is accepted.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let integral = match trimmed.split_once('.') {
            Some((int, frac)) if !frac.is_empty() && frac.bytes().all(|b| b == b'0') => int,
            Some(_) => return None,
            None => trimmed,
        };

        if integral.is_empty() || !integral.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        let canonical = integral.trim_start_matches('0');
        let canonical = if canonical.is_empty() { "0" } else { canonical };
        Some(Self(canonical.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for TokenId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for TokenId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for TokenId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

/// A single `(trait_type, value)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Attributes of one item, at most one value per name, in name order.
///
/// A later pair with an already-present name replaces the earlier value, so
/// per-name counts over a collection never exceed the item count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeSet(BTreeMap<String, Attribute>);

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value previously held under the same name, if any.
    pub fn insert(&mut self, attribute: Attribute) -> Option<Attribute> {
        self.0.insert(attribute.name.clone(), attribute)
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Attribute> for AttributeSet {
    fn from_iter<I: IntoIterator<Item = Attribute>>(iter: I) -> Self {
        let mut set = Self::new();
        for attribute in iter {
            set.insert(attribute);
        }
        set
    }
}

impl<'a> IntoIterator for &'a AttributeSet {
    type Item = &'a Attribute;
    type IntoIter = std::collections::btree_map::Values<'a, String, Attribute>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.values()
    }
}

/// Row as read from the source query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawItem {
    /// Internal row identifier (`asset_extra.asset_id`).
    pub item_id: String,
    pub token_id: Option<String>,
    pub attributes: Option<String>,
}

/// Validated collection member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Item {
    pub item_id: String,
    pub token_id: TokenId,
    pub attributes: AttributeSet,
}

impl Item {
    pub fn new(item_id: impl Into<String>, token_id: TokenId, attributes: AttributeSet) -> Self {
        Self {
            item_id: item_id.into(),
            token_id,
            attributes,
        }
    }
}

/// What to do with a non-blank attribute encoding that cannot be parsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedEncodingPolicy {
    /// Reject the item with `MalformedItemError::AttributeEncoding`.
    #[default]
    Exclude,
    /// Keep the item with an empty attribute set.
    TreatAsEmpty,
}

/// Parse the raw attribute encoding: a JSON list of `{trait_type, value}`
/// objects, tolerating single-quote delimiters.
///
/// Blank or missing encodings yield an empty set. Entries with a missing or
/// empty name or value are skipped.
pub fn parse_attributes(raw: Option<&str>) -> Result<AttributeSet, String> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(AttributeSet::new());
    };

    let parsed: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(strict_err) => {
            let repaired = raw.replace('\'', "\"");
            serde_json::from_str(&repaired).map_err(|_| strict_err.to_string())?
        }
    };

    let entries = match parsed {
        Value::Array(entries) => entries,
        Value::Null => return Ok(AttributeSet::new()),
        other => return Err(format!("expected a list of traits, found {}", json_kind(&other))),
    };

    Ok(entries
        .iter()
        .filter_map(|entry| {
            let name = entry.get("trait_type").and_then(scalar_to_string)?;
            let value = entry.get("value").and_then(scalar_to_string)?;
            Some(Attribute::new(name, value))
        })
        .collect())
}

/// Scalar name or value as text. Falsy scalars (`""`, `0`, `false`, `null`)
/// are treated as absent, as the upstream importers do.
fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
        Value::Bool(true) => Some("true".to_string()),
        _ => None,
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

/// Outcome of validating one snapshot.
#[derive(Debug, Default)]
pub struct PreparedSnapshot {
    pub items: Vec<Item>,
    pub malformed: Vec<MalformedItemError>,
}

/// Validate a single raw row.
pub fn prepare_item(raw: &RawItem, policy: MalformedEncodingPolicy) -> Result<Item, MalformedItemError> {
    let token_raw = raw
        .token_id
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| MalformedItemError::MissingTokenId {
            item_id: raw.item_id.clone(),
        })?;

    let token_id = TokenId::parse(token_raw).ok_or_else(|| MalformedItemError::InvalidTokenId {
        item_id: raw.item_id.clone(),
        raw: token_raw.to_string(),
    })?;

    let attributes = match (parse_attributes(raw.attributes.as_deref()), policy) {
        (Ok(attributes), _) => attributes,
        (Err(reason), MalformedEncodingPolicy::Exclude) => {
            return Err(MalformedItemError::AttributeEncoding {
                item_id: raw.item_id.clone(),
                reason,
            });
        }
        (Err(reason), MalformedEncodingPolicy::TreatAsEmpty) => {
            debug!(item_id = %raw.item_id, %reason, "Treating unparsable attributes as empty");
            AttributeSet::new()
        }
    };

    Ok(Item::new(raw.item_id.clone(), token_id, attributes))
}

/// Validate a whole snapshot, keeping the first item seen for each token id.
pub fn prepare_items(raw_items: &[RawItem], policy: MalformedEncodingPolicy) -> PreparedSnapshot {
    let mut snapshot = PreparedSnapshot::default();
    let mut seen: HashMap<TokenId, String> = HashMap::with_capacity(raw_items.len());

    for raw in raw_items {
        let outcome = prepare_item(raw, policy).and_then(|item| {
            if let Some(first_item_id) = seen.get(&item.token_id) {
                return Err(MalformedItemError::DuplicateToken {
                    item_id: item.item_id.clone(),
                    token_id: item.token_id.to_string(),
                    first_item_id: first_item_id.clone(),
                });
            }
            seen.insert(item.token_id.clone(), item.item_id.clone());
            Ok(item)
        });

        match outcome {
            Ok(item) => snapshot.items.push(item),
            Err(err) => {
                warn!(item_id = %err.item_id(), error = %err, "Excluding malformed item");
                snapshot.malformed.push(err);
            }
        }
    }

    snapshot
}

/// `blake3` digest over the accepted items in token order. Equal snapshots
/// produce equal digests regardless of row order in the source.
pub fn snapshot_digest(items: &[Item]) -> String {
    let mut ordered: Vec<&Item> = items.iter().collect();
    ordered.sort_by(|a, b| a.token_id.cmp(&b.token_id));

    let mut hasher = blake3::Hasher::new();
    for item in ordered {
        hasher.update(item.token_id.as_str().as_bytes());
        for attribute in &item.attributes {
            hasher.update(b"\x1f");
            hasher.update(attribute.name.as_bytes());
            hasher.update(b"=");
            hasher.update(attribute.value.as_bytes());
        }
        hasher.update(b"\x1e");
    }
    hasher.finalize().to_hex().to_string()
}
