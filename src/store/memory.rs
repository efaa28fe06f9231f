use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio::sync::Mutex;

use super::{conflict, DailyMenuStore, FoodCatalog};
use crate::{
    error::VoteError,
    models::{
        daily_menu::{DailyMenuState, DailyResult},
        food::Food,
    },
};

/// Process-local store. Keeps the same versioning contract as the database.
#[derive(Default)]
pub struct MemoryDailyMenuStore {
    inner: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    menus: HashMap<NaiveDate, DailyMenuState>,
    results: BTreeMap<NaiveDate, DailyResult>,
}

impl MemoryDailyMenuStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn write_versioned(
    menus: &mut HashMap<NaiveDate, DailyMenuState>,
    state: &DailyMenuState,
) -> Result<DailyMenuState, VoteError> {
    let stored = menus.get_mut(&state.date).ok_or_else(|| conflict(state.date))?;
    if stored.version != state.version {
        return Err(conflict(state.date));
    }
    let mut saved = state.clone();
    saved.version += 1;
    saved.updated_at = Utc::now();
    *stored = saved.clone();
    Ok(saved)
}

#[async_trait]
impl DailyMenuStore for MemoryDailyMenuStore {
    async fn get(&self, date: NaiveDate) -> Result<Option<DailyMenuState>, VoteError> {
        Ok(self.inner.lock().await.menus.get(&date).cloned())
    }

    async fn insert_if_absent(&self, state: &DailyMenuState) -> Result<DailyMenuState, VoteError> {
        let mut tables = self.inner.lock().await;
        Ok(tables
            .menus
            .entry(state.date)
            .or_insert_with(|| state.clone())
            .clone())
    }

    async fn save(&self, state: &DailyMenuState) -> Result<DailyMenuState, VoteError> {
        let mut tables = self.inner.lock().await;
        write_versioned(&mut tables.menus, state)
    }

    async fn save_with_result(
        &self,
        state: &DailyMenuState,
        result: &DailyResult,
    ) -> Result<DailyMenuState, VoteError> {
        let mut tables = self.inner.lock().await;
        let saved = write_versioned(&mut tables.menus, state)?;
        tables.results.insert(result.date, result.clone());
        Ok(saved)
    }

    async fn delete(&self, date: NaiveDate) -> Result<bool, VoteError> {
        Ok(self.inner.lock().await.menus.remove(&date).is_some())
    }

    async fn get_result(&self, date: NaiveDate) -> Result<Option<DailyResult>, VoteError> {
        Ok(self.inner.lock().await.results.get(&date).cloned())
    }

    async fn list_results(&self, limit: i64) -> Result<Vec<DailyResult>, VoteError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .inner
            .lock()
            .await
            .results
            .values()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fixed catalog, for tests and local runs without a database.
#[derive(Default)]
pub struct MemoryFoodCatalog {
    foods: HashMap<i32, String>,
}

impl MemoryFoodCatalog {
    pub fn with_foods<I, S>(foods: I) -> Self
    where
        I: IntoIterator<Item = (i32, S)>,
        S: Into<String>,
    {
        Self {
            foods: foods.into_iter().map(|(id, name)| (id, name.into())).collect(),
        }
    }

    /// A handful of dishes so the API is usable out of the box.
    pub fn demo() -> Self {
        Self::with_foods([
            (1, "Bibimbap"),
            (2, "Kimchi stew"),
            (3, "Fried rice"),
            (4, "Tteokbokki"),
            (5, "Cold noodles"),
            (6, "Pork cutlet"),
        ])
    }
}

#[async_trait]
impl FoodCatalog for MemoryFoodCatalog {
    async fn find(&self, ids: &[i32]) -> anyhow::Result<Vec<Food>> {
        Ok(ids
            .iter()
            .filter_map(|id| {
                self.foods.get(id).map(|name| Food {
                    id: *id,
                    name: name.clone(),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 2).unwrap()
    }

    #[tokio::test]
    async fn test_insert_if_absent_keeps_first_record() {
        let store = MemoryDailyMenuStore::new();
        let first = store.insert_if_absent(&DailyMenuState::new(date())).await.unwrap();

        let mut other = DailyMenuState::new(date());
        other.is_visible = false;
        let second = store.insert_if_absent(&other).await.unwrap();

        assert_eq!(first, second);
        assert!(second.is_visible);
    }

    #[tokio::test]
    async fn test_stale_save_is_a_conflict() {
        let store = MemoryDailyMenuStore::new();
        let state = store.insert_if_absent(&DailyMenuState::new(date())).await.unwrap();

        let saved = store.save(&state).await.unwrap();
        assert_eq!(saved.version, state.version + 1);

        // Second writer still holds the old version
        let err = store.save(&state).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_save_of_missing_record_is_a_conflict() {
        let store = MemoryDailyMenuStore::new();
        let err = store.save(&DailyMenuState::new(date())).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_catalog_skips_unknown_ids() {
        let catalog = MemoryFoodCatalog::with_foods([(1, "Bibimbap")]);
        let found = catalog.find(&[1, 2]).await.unwrap();
        assert_eq!(found, vec![Food { id: 1, name: "Bibimbap".into() }]);
    }
}
