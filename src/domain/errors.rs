//! Error taxonomy for the rarity synchronization pipeline
//!
//! Fatal categories (`Configuration`, `SourceUnavailable`, `Cancelled`) abort a
//! run immediately. The remaining categories are accumulated per run and
//! surfaced in the final summary.

use thiserror::Error;

/// Errors raised by store implementations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store operation '{operation}' timed out after {secs}s")]
    Timeout { operation: &'static str, secs: u64 },

    #[error("Invalid row in {table}: {reason}")]
    InvalidRow { table: &'static str, reason: String },
}

impl StoreError {
    pub fn invalid_row(table: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidRow {
            table,
            reason: reason.into(),
        }
    }
}

/// Why a single item was rejected from ranking.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedItemError {
    #[error("item {item_id}: token id is missing")]
    MissingTokenId { item_id: String },

    #[error("item {item_id}: token id '{raw}' is not a non-negative integer")]
    InvalidTokenId { item_id: String, raw: String },

    #[error("item {item_id}: attribute encoding could not be parsed: {reason}")]
    AttributeEncoding { item_id: String, reason: String },

    #[error("item {item_id}: token id {token_id} already belongs to item {first_item_id}")]
    DuplicateToken {
        item_id: String,
        token_id: String,
        first_item_id: String,
    },
}

impl MalformedItemError {
    pub fn item_id(&self) -> &str {
        match self {
            Self::MissingTokenId { item_id }
            | Self::InvalidTokenId { item_id, .. }
            | Self::AttributeEncoding { item_id, .. }
            | Self::DuplicateToken { item_id, .. } => item_id,
        }
    }
}

/// Pipeline-level error taxonomy.
#[derive(Error, Debug)]
pub enum RarityError {
    #[error("Configuration error in '{field}': {message}")]
    Configuration { field: String, message: String },

    #[error("Source unavailable for collection '{collection}': {reason}")]
    SourceUnavailable { collection: String, reason: String },

    #[error(transparent)]
    MalformedItem(#[from] MalformedItemError),

    #[error("No target row for key '{key}'")]
    UnmatchedKey { key: String },

    #[error("Batch {batch_index} ({entries} entries) of {target} failed: {source}")]
    BatchWrite {
        target: &'static str,
        batch_index: usize,
        entries: usize,
        #[source]
        source: StoreError,
    },

    #[error("Verification mismatch on {target}: expected {expected}, found {actual}")]
    VerificationMismatch {
        target: &'static str,
        expected: String,
        actual: String,
    },

    #[error("Step {stage} failed: {source}")]
    Step {
        stage: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("Run cancelled before {stage}")]
    Cancelled { stage: &'static str },

    #[error("Report export failed: {0}")]
    Export(#[from] std::io::Error),
}

impl RarityError {
    pub fn configuration(field: &str, message: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Fatal errors abort the run; the rest are tallied and reported.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. }
                | Self::SourceUnavailable { .. }
                | Self::Step { .. }
                | Self::Cancelled { .. }
        )
    }
}

pub type RarityResult<T> = Result<T, RarityError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification_follows_taxonomy() {
        assert!(RarityError::configuration("collection.slug", "missing").is_fatal());
        assert!(
            RarityError::SourceUnavailable {
                collection: "doodles".into(),
                reason: "connection refused".into(),
            }
            .is_fatal()
        );
        assert!(!RarityError::UnmatchedKey { key: "42".into() }.is_fatal());
        assert!(
            !RarityError::VerificationMismatch {
                target: "rarity_ranking",
                expected: "10".into(),
                actual: "9".into(),
            }
            .is_fatal()
        );
    }

    #[test]
    fn malformed_item_exposes_item_id() {
        let err = MalformedItemError::InvalidTokenId {
            item_id: "a-1".into(),
            raw: "-3".into(),
        };
        assert_eq!(err.item_id(), "a-1");
        assert!(err.to_string().contains("-3"));
    }
}
