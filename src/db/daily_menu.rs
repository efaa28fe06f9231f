use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{types::Json, FromRow, PgExecutor, PgPool};

use crate::{
    error::VoteError,
    models::daily_menu::{DailyMenuState, DailyResult, Pack},
    store::{conflict, DailyMenuStore},
};

const MENU_COLUMNS: &str = "date, status, vote_options, voted_users, winning_food_id, \
     admin_set_food_id, is_visible, version, updated_at";

const RESULT_COLUMNS: &str = "date, winning_food_id, winning_food_ids, winning_food_name, \
     total_votes, vote_options, created_at";

/// DB row; status is TEXT and the JSONB columns are decoded here so the core
/// only ever sees typed values.
#[derive(Debug, FromRow)]
struct DailyMenuRow {
    date: NaiveDate,
    status: String,
    vote_options: Json<Vec<Pack>>,
    voted_users: Json<BTreeMap<String, usize>>,
    winning_food_id: Option<i32>,
    admin_set_food_id: Option<i32>,
    is_visible: bool,
    version: i64,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DailyMenuRow> for DailyMenuState {
    type Error = anyhow::Error;

    fn try_from(row: DailyMenuRow) -> Result<Self, Self::Error> {
        let state = DailyMenuState {
            date: row.date,
            status: row.status.parse()?,
            vote_options: row.vote_options.0,
            voted_users: row.voted_users.0,
            winning_food_id: row.winning_food_id,
            admin_set_food_id: row.admin_set_food_id,
            is_visible: row.is_visible,
            version: row.version,
            updated_at: row.updated_at,
        };
        state.check_consistency()?;
        Ok(state)
    }
}

#[derive(Debug, FromRow)]
struct DailyResultRow {
    date: NaiveDate,
    winning_food_id: i32,
    winning_food_ids: Json<Vec<i32>>,
    winning_food_name: String,
    total_votes: i64,
    vote_options: Json<Vec<Pack>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<DailyResultRow> for DailyResult {
    type Error = anyhow::Error;

    fn try_from(row: DailyResultRow) -> Result<Self, Self::Error> {
        Ok(DailyResult {
            date: row.date,
            winning_food_id: row.winning_food_id,
            winning_food_ids: row.winning_food_ids.0,
            winning_food_name: row.winning_food_name,
            total_votes: u32::try_from(row.total_votes)?,
            vote_options: row.vote_options.0,
            created_at: row.created_at,
        })
    }
}

fn into_state(row: DailyMenuRow) -> Result<DailyMenuState, VoteError> {
    Ok(DailyMenuState::try_from(row)?)
}

pub struct PgDailyMenuStore {
    pool: PgPool,
}

impl PgDailyMenuStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Version-checked UPDATE. `None` means another writer got there first, or
/// the record was deleted in the meantime.
async fn update_versioned<'e, E: PgExecutor<'e>>(
    executor: E,
    state: &DailyMenuState,
) -> Result<Option<DailyMenuRow>, sqlx::Error> {
    sqlx::query_as::<_, DailyMenuRow>(&format!(
        r#"UPDATE daily_menu_states
           SET status = $2,
               vote_options = $3,
               voted_users = $4,
               winning_food_id = $5,
               admin_set_food_id = $6,
               is_visible = $7,
               version = version + 1,
               updated_at = NOW()
           WHERE date = $1 AND version = $8
           RETURNING {MENU_COLUMNS}"#
    ))
    .bind(state.date)
    .bind(state.status.to_string())
    .bind(Json(&state.vote_options))
    .bind(Json(&state.voted_users))
    .bind(state.winning_food_id)
    .bind(state.admin_set_food_id)
    .bind(state.is_visible)
    .bind(state.version)
    .fetch_optional(executor)
    .await
}

#[async_trait]
impl DailyMenuStore for PgDailyMenuStore {
    async fn get(&self, date: NaiveDate) -> Result<Option<DailyMenuState>, VoteError> {
        let row = sqlx::query_as::<_, DailyMenuRow>(&format!(
            "SELECT {MENU_COLUMNS} FROM daily_menu_states WHERE date = $1"
        ))
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        row.map(into_state).transpose()
    }

    async fn insert_if_absent(&self, state: &DailyMenuState) -> Result<DailyMenuState, VoteError> {
        sqlx::query(
            r#"INSERT INTO daily_menu_states
                   (date, status, vote_options, voted_users, is_visible, version)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (date) DO NOTHING"#,
        )
        .bind(state.date)
        .bind(state.status.to_string())
        .bind(Json(&state.vote_options))
        .bind(Json(&state.voted_users))
        .bind(state.is_visible)
        .bind(state.version)
        .execute(&self.pool)
        .await?;

        // Either our row or the one a concurrent caller inserted first
        self.get(state.date).await?.ok_or_else(|| conflict(state.date))
    }

    async fn save(&self, state: &DailyMenuState) -> Result<DailyMenuState, VoteError> {
        let row = update_versioned(&self.pool, state).await?;
        row.map(into_state).transpose()?.ok_or_else(|| conflict(state.date))
    }

    async fn save_with_result(
        &self,
        state: &DailyMenuState,
        result: &DailyResult,
    ) -> Result<DailyMenuState, VoteError> {
        let mut tx = self.pool.begin().await?;

        let Some(row) = update_versioned(&mut *tx, state).await? else {
            tx.rollback().await?;
            return Err(conflict(state.date));
        };

        sqlx::query(
            r#"INSERT INTO daily_results
                   (date, winning_food_id, winning_food_ids, winning_food_name,
                    total_votes, vote_options, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               ON CONFLICT (date) DO UPDATE SET
                   winning_food_id = EXCLUDED.winning_food_id,
                   winning_food_ids = EXCLUDED.winning_food_ids,
                   winning_food_name = EXCLUDED.winning_food_name,
                   total_votes = EXCLUDED.total_votes,
                   vote_options = EXCLUDED.vote_options,
                   created_at = EXCLUDED.created_at"#,
        )
        .bind(result.date)
        .bind(result.winning_food_id)
        .bind(Json(&result.winning_food_ids))
        .bind(&result.winning_food_name)
        .bind(i64::from(result.total_votes))
        .bind(Json(&result.vote_options))
        .bind(result.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        into_state(row)
    }

    async fn delete(&self, date: NaiveDate) -> Result<bool, VoteError> {
        let deleted = sqlx::query("DELETE FROM daily_menu_states WHERE date = $1")
            .bind(date)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    async fn get_result(&self, date: NaiveDate) -> Result<Option<DailyResult>, VoteError> {
        let row = sqlx::query_as::<_, DailyResultRow>(&format!(
            "SELECT {RESULT_COLUMNS} FROM daily_results WHERE date = $1"
        ))
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(DailyResult::try_from).transpose()?)
    }

    async fn list_results(&self, limit: i64) -> Result<Vec<DailyResult>, VoteError> {
        let rows = sqlx::query_as::<_, DailyResultRow>(&format!(
            "SELECT {RESULT_COLUMNS} FROM daily_results ORDER BY date DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        let results = rows
            .into_iter()
            .map(DailyResult::try_from)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(results)
    }

    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
