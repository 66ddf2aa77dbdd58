//! PostgreSQL implementation of `RarityStore`
//!
//! Batches are bound as parallel arrays and joined through `UNNEST`, so one
//! statement updates a whole batch regardless of its size.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use crate::domain::item::{RawItem, TokenId};
use crate::domain::repositories::{
    PercentageUpdate, PercentageWriteOutcome, RankUpdate, RankWriteOutcome, RarityStore,
    StoreResult, TraitKey, VerificationAggregate,
};
use crate::infrastructure::sqlite_rarity_store::index_by_token;

const LOAD_ITEMS_SQL: &str = r"
    SELECT ae.asset_id::text, a.token_id::text, a.traits::text
    FROM asset_extra ae
    LEFT JOIN asset a ON ae.asset_id = a.id
    JOIN collections c ON ae.collection_id = c.id
    WHERE c.slug = $1
    ORDER BY ae.asset_id
";

const RESOLVE_SQL: &str = r"
    SELECT ae.asset_id::text, a.token_id::text
    FROM asset_extra ae
    JOIN asset a ON ae.asset_id = a.id
    JOIN collections c ON ae.collection_id = c.id
    WHERE c.slug = $1
    ORDER BY ae.asset_id
";

const RANK_BATCH_SQL: &str = r"
    UPDATE asset_extra AS ae
    SET rarity_ranking = v.rank
    FROM UNNEST($1::text[], $2::int8[]) AS v(asset_id, rank)
    WHERE ae.asset_id = v.asset_id::uuid
      AND ae.collection_id = (SELECT id FROM collections WHERE slug = $3)
";

const PERCENTAGE_BATCH_SQL: &str = r"
    UPDATE asset_traits AS at
    SET rarity_percent = v.percentage
    FROM UNNEST($1::text[], $2::text[], $3::float8[]) AS v(trait_type, value, percentage)
    WHERE at.trait_type = v.trait_type
      AND at.value = v.value
      AND at.collection_id = (SELECT id FROM collections WHERE slug = $4)
    RETURNING at.trait_type, at.value
";

const SET_FLAG_SQL: &str =
    "UPDATE collections SET is_rarity = TRUE WHERE slug = $1 AND is_rarity IS NOT TRUE";

const REFRESH_TOTAL_COUNT_SQL: &str = r"
    WITH traits_count AS (
        SELECT trait_type, value, COUNT(*) AS n
        FROM asset_traits
        WHERE collection_id = (SELECT id FROM collections WHERE slug = $1)
        GROUP BY trait_type, value
    )
    UPDATE asset_traits AS at
    SET total_count = tc.n
    FROM traits_count tc
    WHERE at.collection_id = (SELECT id FROM collections WHERE slug = $1)
      AND at.trait_type = tc.trait_type
      AND at.value = tc.value
";

const VERIFY_RANKS_SQL: &str = r"
    SELECT COUNT(*)::int8, MIN(ae.rarity_ranking)::float8, MAX(ae.rarity_ranking)::float8
    FROM asset_extra ae
    JOIN asset a ON ae.asset_id = a.id
    JOIN collections c ON ae.collection_id = c.id
    WHERE c.slug = $1 AND ae.rarity_ranking IS NOT NULL
";

const VERIFY_PERCENTAGES_SQL: &str = r"
    SELECT COUNT(*)::int8, MIN(at.rarity_percent)::float8, MAX(at.rarity_percent)::float8
    FROM asset_traits at
    JOIN collections c ON at.collection_id = c.id
    WHERE c.slug = $1 AND at.rarity_percent IS NOT NULL
";

pub struct PostgresRarityStore {
    pool: PgPool,
}

impl PostgresRarityStore {
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Split rank updates into the parallel arrays bound to `UNNEST`.
fn rank_columns(updates: &[RankUpdate]) -> (Vec<String>, Vec<i64>) {
    updates
        .iter()
        .map(|u| (u.asset_id.clone(), u.rank))
        .unzip()
}

fn percentage_columns(updates: &[PercentageUpdate]) -> (Vec<String>, Vec<String>, Vec<f64>) {
    let mut trait_types = Vec::with_capacity(updates.len());
    let mut values = Vec::with_capacity(updates.len());
    let mut percentages = Vec::with_capacity(updates.len());
    for update in updates {
        trait_types.push(update.key.trait_type.clone());
        values.push(update.key.value.clone());
        percentages.push(update.percentage);
    }
    (trait_types, values, percentages)
}

#[async_trait]
impl RarityStore for PostgresRarityStore {
    async fn load_items(&self, collection: &str) -> StoreResult<Option<Vec<RawItem>>> {
        if self.rarity_flag(collection).await?.is_none() {
            return Ok(None);
        }

        let rows: Vec<(String, Option<String>, Option<String>)> = sqlx::query_as(LOAD_ITEMS_SQL)
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
            sqlx::query_as("SELECT is_rarity FROM collections WHERE slug = $1")
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
        let rows: Vec<(String, Option<String>)> = sqlx::query_as(RESOLVE_SQL)
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

        let (asset_ids, ranks) = rank_columns(updates);
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(RANK_BATCH_SQL)
            .bind(&asset_ids)
            .bind(&ranks)
            .bind(collection)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let mut flag_set = false;
        if set_flag {
            flag_set = sqlx::query(SET_FLAG_SQL)
                .bind(collection)
                .execute(&mut *tx)
                .await?
                .rows_affected()
                > 0;
        }

        tx.commit().await?;
        Ok(RankWriteOutcome {
            rows_updated: rows,
            flag_set,
        })
    }

    async fn write_percentage_batch(
        &self,
        collection: &str,
        updates: &[PercentageUpdate],
    ) -> StoreResult<PercentageWriteOutcome> {
        if updates.is_empty() {
            return Ok(PercentageWriteOutcome::default());
        }

        let (trait_types, values, percentages) = percentage_columns(updates);
        let mut tx = self.pool.begin().await?;

        let touched: Vec<(String, String)> = sqlx::query_as(PERCENTAGE_BATCH_SQL)
            .bind(&trait_types)
            .bind(&values)
            .bind(&percentages)
            .bind(collection)
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(PercentageWriteOutcome {
            rows_updated: touched.len() as u64,
            matched: touched
                .into_iter()
                .map(|(trait_type, value)| TraitKey::new(trait_type, value))
                .collect(),
        })
    }

    async fn refresh_trait_total_counts(&self, collection: &str) -> StoreResult<u64> {
        let result = sqlx::query(REFRESH_TOTAL_COUNT_SQL)
            .bind(collection)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn verify_ranks(&self, collection: &str) -> StoreResult<VerificationAggregate> {
        let (rows, min, max): (i64, Option<f64>, Option<f64>) = sqlx::query_as(VERIFY_RANKS_SQL)
            .bind(collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(VerificationAggregate { rows, min, max })
    }

    async fn verify_percentages(&self, collection: &str) -> StoreResult<VerificationAggregate> {
        let (rows, min, max): (i64, Option<f64>, Option<f64>) =
            sqlx::query_as(VERIFY_PERCENTAGES_SQL)
                .bind(collection)
                .fetch_one(&self.pool)
                .await?;
        Ok(VerificationAggregate { rows, min, max })
    }
}
