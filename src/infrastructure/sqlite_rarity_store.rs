//! SQLite implementation of `RarityStore`
//!
//! Batches are written as `UPDATE ... FROM` over a bound `VALUES` list inside
//! a single transaction per batch. A batch larger than SQLite's bind limit is
//! split into several statements within that same transaction.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, warn};

use crate::domain::item::{RawItem, TokenId};
use crate::domain::repositories::{
    PercentageUpdate, PercentageWriteOutcome, RankUpdate, RankWriteOutcome, RarityStore,
    StoreResult, TraitKey, VerificationAggregate,
};

/// Host parameters SQLite accepts in one statement (`SQLITE_MAX_VARIABLE_NUMBER`
/// since 3.32).
pub const SQLITE_BIND_LIMIT: usize = 32_766;

/// Rank entries per statement: two binds each plus the collection slug.
pub(crate) const RANK_ROWS_PER_STATEMENT: usize = (SQLITE_BIND_LIMIT - 1) / 2;

/// Percentage entries per statement: three binds each plus the collection slug.
pub(crate) const PERCENTAGE_ROWS_PER_STATEMENT: usize = (SQLITE_BIND_LIMIT - 1) / 3;

pub struct SqliteRarityStore {
    pool: SqlitePool,
}

impl SqliteRarityStore {
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Keep the first asset seen for each canonical token id.
pub(crate) fn index_by_token(
    rows: Vec<(String, Option<String>)>,
    wanted: &HashSet<&TokenId>,
) -> HashMap<TokenId, String> {
    let mut resolved = HashMap::with_capacity(wanted.len());
    for (asset_id, raw_token) in rows {
        let Some(token_id) = raw_token.as_deref().and_then(TokenId::parse) else {
            continue;
        };
        if !wanted.contains(&token_id) {
            continue;
        }
        if let Some(existing) = resolved.get(&token_id) {
            warn!(%token_id, kept = %existing, ignored = %asset_id, "Token id maps to several assets");
            continue;
        }
        resolved.insert(token_id, asset_id);
    }
    resolved
}

#[async_trait]
impl RarityStore for SqliteRarityStore {
    async fn load_items(&self, collection: &str) -> StoreResult<Option<Vec<RawItem>>> {
        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM collections WHERE slug = ?")
            .bind(collection)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Ok(None);
        }

        let rows: Vec<(String, Option<String>, Option<String>)> = sqlx::query_as(
            r"
            SELECT asset_extra.asset_id, CAST(asset.token_id AS TEXT), asset.traits
            FROM asset_extra
            LEFT JOIN asset ON asset_extra.asset_id = asset.id
            JOIN collections ON asset_extra.collection_id = collections.id
            WHERE collections.slug = ?
            ORDER BY asset_extra.asset_id
            ",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        debug!(collection, rows = rows.len(), "Loaded collection rows");
        Ok(Some(
            rows.into_iter()
                .map(|(item_id, token_id, attributes)| RawItem {
                    item_id,
                    token_id,
                    attributes,
                })
                .collect(),
        ))
    }

    async fn rarity_flag(&self, collection: &str) -> StoreResult<Option<bool>> {
        let flag: Option<(Option<bool>,)> =
            sqlx::query_as("SELECT is_rarity FROM collections WHERE slug = ?")
                .bind(collection)
                .fetch_optional(&self.pool)
                .await?;
        Ok(flag.map(|(f,)| f.unwrap_or(false)))
    }

    async fn resolve_asset_ids(
        &self,
        collection: &str,
        token_ids: &[TokenId],
    ) -> StoreResult<HashMap<TokenId, String>> {
        let rows: Vec<(String, Option<String>)> = sqlx::query_as(
            r"
            SELECT asset_extra.asset_id, CAST(asset.token_id AS TEXT)
            FROM asset_extra
            JOIN asset ON asset_extra.asset_id = asset.id
            JOIN collections ON asset_extra.collection_id = collections.id
            WHERE collections.slug = ?
            ORDER BY asset_extra.asset_id
            ",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        let wanted: HashSet<&TokenId> = token_ids.iter().collect();
        Ok(index_by_token(rows, &wanted))
    }

    async fn write_rank_batch(
        &self,
        collection: &str,
        updates: &[RankUpdate],
        set_flag: bool,
    ) -> StoreResult<RankWriteOutcome> {
        if updates.is_empty() && !set_flag {
            return Ok(RankWriteOutcome::default());
        }

        let mut tx = self.pool.begin().await?;
        let mut outcome = RankWriteOutcome::default();

        for chunk in updates.chunks(RANK_ROWS_PER_STATEMENT) {
            let mut query: QueryBuilder<Sqlite> =
                QueryBuilder::new("WITH v(v_asset_id, v_rank) AS (");
            query.push_values(chunk, |mut row, update| {
                row.push_bind(update.asset_id.clone()).push_bind(update.rank);
            });
            query.push(
                ") UPDATE asset_extra SET rarity_ranking = v.v_rank FROM v \
                 WHERE asset_extra.asset_id = v.v_asset_id \
                 AND asset_extra.collection_id = (SELECT id FROM collections WHERE slug = ",
            );
            query.push_bind(collection);
            query.push(")");

            outcome.rows_updated += query.build().execute(&mut *tx).await?.rows_affected();
        }

        if set_flag {
            outcome.flag_set = sqlx::query(
                "UPDATE collections SET is_rarity = 1 WHERE slug = ? AND IFNULL(is_rarity, 0) = 0",
            )
            .bind(collection)
            .execute(&mut *tx)
            .await?
            .rows_affected()
                > 0;
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn write_percentage_batch(
        &self,
        collection: &str,
        updates: &[PercentageUpdate],
    ) -> StoreResult<PercentageWriteOutcome> {
        if updates.is_empty() {
            return Ok(PercentageWriteOutcome::default());
        }

        let mut tx = self.pool.begin().await?;
        let mut outcome = PercentageWriteOutcome::default();

        for chunk in updates.chunks(PERCENTAGE_ROWS_PER_STATEMENT) {
            let mut query: QueryBuilder<Sqlite> =
                QueryBuilder::new("WITH v(v_trait_type, v_value, v_percentage) AS (");
            query.push_values(chunk, |mut row, update| {
                row.push_bind(update.key.trait_type.clone())
                    .push_bind(update.key.value.clone())
                    .push_bind(update.percentage);
            });
            query.push(
                ") UPDATE asset_traits SET rarity_percent = v.v_percentage FROM v \
                 WHERE asset_traits.trait_type = v.v_trait_type \
                 AND asset_traits.value = v.v_value \
                 AND asset_traits.collection_id = (SELECT id FROM collections WHERE slug = ",
            );
            query.push_bind(collection);
            query.push(") RETURNING trait_type, value");

            let touched: Vec<(String, String)> = query.build_query_as().fetch_all(&mut *tx).await?;
            outcome.rows_updated += touched.len() as u64;
            outcome.matched.extend(
                touched
                    .into_iter()
                    .map(|(trait_type, value)| TraitKey::new(trait_type, value)),
            );
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn refresh_trait_total_counts(&self, collection: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            r"
            WITH traits_count AS (
                SELECT trait_type AS t_type, value AS t_value, COUNT(*) AS n
                FROM asset_traits
                WHERE collection_id = (SELECT id FROM collections WHERE slug = ?)
                GROUP BY trait_type, value
            )
            UPDATE asset_traits
            SET total_count = traits_count.n
            FROM traits_count
            WHERE asset_traits.collection_id = (SELECT id FROM collections WHERE slug = ?)
              AND asset_traits.trait_type = traits_count.t_type
              AND asset_traits.value = traits_count.t_value
            ",
        )
        .bind(collection)
        .bind(collection)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn verify_ranks(&self, collection: &str) -> StoreResult<VerificationAggregate> {
        let (rows, min, max): (i64, Option<f64>, Option<f64>) = sqlx::query_as(
            r"
            SELECT COUNT(*), CAST(MIN(asset_extra.rarity_ranking) AS REAL),
                   CAST(MAX(asset_extra.rarity_ranking) AS REAL)
            FROM asset_extra
            JOIN asset ON asset_extra.asset_id = asset.id
            JOIN collections ON asset_extra.collection_id = collections.id
            WHERE collections.slug = ? AND asset_extra.rarity_ranking IS NOT NULL
            ",
        )
        .bind(collection)
        .fetch_one(&self.pool)
        .await?;
        Ok(VerificationAggregate { rows, min, max })
    }

    async fn verify_percentages(&self, collection: &str) -> StoreResult<VerificationAggregate> {
        let (rows, min, max): (i64, Option<f64>, Option<f64>) = sqlx::query_as(
            r"
            SELECT COUNT(*), MIN(asset_traits.rarity_percent), MAX(asset_traits.rarity_percent)
            FROM asset_traits
            JOIN collections ON asset_traits.collection_id = collections.id
            WHERE collections.slug = ? AND asset_traits.rarity_percent IS NOT NULL
            ",
        )
        .bind(collection)
        .fetch_one(&self.pool)
        .await?;
        Ok(VerificationAggregate { rows, min, max })
    }
}
