//! Storage seams of the voting core.
//!
//! The service only talks to these traits; `db` provides the PostgreSQL
//! implementations and `memory` the in-process ones used by tests and the
//! `--in-memory` development mode.

pub mod memory;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::{
    error::VoteError,
    models::{
        daily_menu::{DailyMenuState, DailyResult},
        food::Food,
    },
};

#[async_trait]
pub trait DailyMenuStore: Send + Sync {
    async fn get(&self, date: NaiveDate) -> Result<Option<DailyMenuState>, VoteError>;

    /// Insert `state` unless a record for its date already exists, and return
    /// whichever record is stored afterwards.
    async fn insert_if_absent(&self, state: &DailyMenuState) -> Result<DailyMenuState, VoteError>;

    /// Conditional write: succeeds only while the stored version still equals
    /// `state.version`, and returns the record with its version bumped.
    /// Any other outcome is `VoteError::Conflict`.
    async fn save(&self, state: &DailyMenuState) -> Result<DailyMenuState, VoteError>;

    /// Same as `save`, and upserts `result` atomically with it.
    async fn save_with_result(
        &self,
        state: &DailyMenuState,
        result: &DailyResult,
    ) -> Result<DailyMenuState, VoteError>;

    /// Returns whether a record was removed. Results are left alone.
    async fn delete(&self, date: NaiveDate) -> Result<bool, VoteError>;

    async fn get_result(&self, date: NaiveDate) -> Result<Option<DailyResult>, VoteError>;

    /// Most recent results first.
    async fn list_results(&self, limit: i64) -> Result<Vec<DailyResult>, VoteError>;

    async fn ping(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait FoodCatalog: Send + Sync {
    /// Look up the given ids; unknown ids are simply absent from the output.
    async fn find(&self, ids: &[i32]) -> anyhow::Result<Vec<Food>>;
}

pub(crate) fn conflict(date: NaiveDate) -> VoteError {
    VoteError::Conflict(format!(
        "Daily menu for {date} was modified concurrently, retry the request"
    ))
}
