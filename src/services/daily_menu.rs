use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::{
    error::VoteError,
    models::daily_menu::{
        build_packs, referenced_food_ids, validate_pack_requests, DailyMenuState, DailyResult,
        PackRequest, VoteChange,
    },
    services::metrics::{ROUNDS_COUNTER, VOTES_COUNTER},
    store::{DailyMenuStore, FoodCatalog},
};

/// Entries beyond this many trigger a sweep of unused per-date locks.
const LOCK_SWEEP_THRESHOLD: usize = 64;

/// One async mutex per date. Holding the guard serializes read-modify-write
/// cycles for that date inside this process; other dates are unaffected.
#[derive(Default)]
pub struct DateLocks {
    locks: Mutex<HashMap<NaiveDate, Arc<Mutex<()>>>>,
}

impl DateLocks {
    pub async fn acquire(&self, date: NaiveDate) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            if locks.len() > LOCK_SWEEP_THRESHOLD {
                // Only the map holds a reference to idle locks
                locks.retain(|_, l| Arc::strong_count(l) > 1);
            }
            locks.entry(date).or_default().clone()
        };
        lock.lock_owned().await
    }
}

pub struct DailyMenuService {
    store: Arc<dyn DailyMenuStore>,
    catalog: Arc<dyn FoodCatalog>,
    locks: DateLocks,
}

impl DailyMenuService {
    pub fn new(store: Arc<dyn DailyMenuStore>, catalog: Arc<dyn FoodCatalog>) -> Self {
        Self {
            store,
            catalog,
            locks: DateLocks::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn DailyMenuStore> {
        &self.store
    }

    /// Fetch the record for `date`, creating an idle one on first access.
    pub async fn get_or_create(&self, date: NaiveDate) -> Result<DailyMenuState, VoteError> {
        if let Some(state) = self.store.get(date).await? {
            return Ok(state);
        }
        let state = self.store.insert_if_absent(&DailyMenuState::new(date)).await?;
        debug!(%date, "daily menu record created");
        Ok(state)
    }

    /// Run one read-modify-write cycle under the date lock. The write is
    /// version-checked, so a writer in another process surfaces as `Conflict`.
    /// Changes that leave the record as it was are not written; the returned
    /// flag tells whether a write happened.
    async fn mutate<T, F>(
        &self,
        date: NaiveDate,
        create_if_missing: bool,
        apply: F,
    ) -> Result<(DailyMenuState, T, bool), VoteError>
    where
        F: FnOnce(&mut DailyMenuState) -> Result<T, VoteError>,
    {
        let _guard = self.locks.acquire(date).await;

        let mut state = if create_if_missing {
            self.get_or_create(date).await?
        } else {
            self.store
                .get(date)
                .await?
                .ok_or_else(|| VoteError::not_found(format!("No daily menu for {date}")))?
        };

        let before = state.clone();
        let outcome = apply(&mut state).map_err(|e| {
            debug!(%date, "daily menu change rejected: {e}");
            e
        })?;
        if state == before {
            return Ok((state, outcome, false));
        }
        let saved = self.store.save(&state).await?;
        Ok((saved, outcome, true))
    }

    async fn resolve_names(&self, ids: &[i32]) -> Result<HashMap<i32, String>, VoteError> {
        let foods = self.catalog.find(ids).await?;
        Ok(foods.into_iter().map(|f| (f.id, f.name)).collect())
    }

    pub async fn start_voting(
        &self,
        date: NaiveDate,
        packs: &[PackRequest],
    ) -> Result<DailyMenuState, VoteError> {
        validate_pack_requests(packs)?;
        // A hidden date rejects the round before any catalog lookup
        if let Some(existing) = self.store.get(date).await? {
            existing.ensure_visible()?;
        }
        let names = self.resolve_names(&referenced_food_ids(packs)).await?;
        let packs = build_packs(packs, &names)?;
        let pack_count = packs.len();

        let (state, (), _) = self
            .mutate(date, true, move |state| state.start_voting(packs))
            .await?;

        ROUNDS_COUNTER.with_label_values(&["started"]).inc();
        info!(%date, packs = pack_count, "voting started");
        Ok(state)
    }

    pub async fn cast_vote(
        &self,
        date: NaiveDate,
        user_id: &str,
        pack_index: i64,
    ) -> Result<DailyMenuState, VoteError> {
        let (state, change, _) = self
            .mutate(date, false, |state| state.cast_vote(user_id, pack_index))
            .await?;

        VOTES_COUNTER.with_label_values(&[change.label()]).inc();
        match change {
            VoteChange::Changed { from } => {
                info!(%date, user_id, from, to = pack_index, "vote changed")
            }
            VoteChange::Cast => info!(%date, user_id, pack = pack_index, "vote cast"),
            VoteChange::Unchanged => debug!(%date, user_id, "repeated vote ignored"),
        }
        Ok(state)
    }

    pub async fn cancel_vote(
        &self,
        date: NaiveDate,
        user_id: &str,
    ) -> Result<DailyMenuState, VoteError> {
        let (state, pack, _) = self
            .mutate(date, false, |state| state.cancel_vote(user_id))
            .await?;

        VOTES_COUNTER.with_label_values(&["cancelled"]).inc();
        info!(%date, user_id, pack, "vote cancelled");
        Ok(state)
    }

    /// Close the round and persist its result in the same write.
    pub async fn close_voting(&self, date: NaiveDate) -> Result<DailyMenuState, VoteError> {
        let _guard = self.locks.acquire(date).await;

        let mut state = self
            .store
            .get(date)
            .await?
            .ok_or_else(|| VoteError::not_found(format!("No daily menu for {date}")))?;
        let result = state.close()?;
        let saved = self.store.save_with_result(&state, &result).await?;

        ROUNDS_COUNTER.with_label_values(&["closed"]).inc();
        info!(
            %date,
            winner = %result.winning_food_name,
            total_votes = result.total_votes,
            "voting closed"
        );
        Ok(saved)
    }

    pub async fn admin_set_food(
        &self,
        date: NaiveDate,
        food_id: i32,
    ) -> Result<DailyMenuState, VoteError> {
        let names = self.resolve_names(&[food_id]).await?;
        if !names.contains_key(&food_id) {
            return Err(VoteError::not_found(format!("Unknown food id: {food_id}")));
        }

        let (state, (), written) = self
            .mutate(date, true, |state| state.admin_set(food_id))
            .await?;

        if written {
            ROUNDS_COUNTER.with_label_values(&["admin_set"]).inc();
            info!(%date, food_id, "food of the day set by admin");
        } else {
            debug!(%date, food_id, "food of the day already set");
        }
        Ok(state)
    }

    pub async fn set_visibility(
        &self,
        date: NaiveDate,
        visible: bool,
    ) -> Result<DailyMenuState, VoteError> {
        let (state, (), written) = self
            .mutate(date, true, |state| {
                state.set_visibility(visible);
                Ok(())
            })
            .await?;

        if written {
            info!(%date, visible, "visibility changed");
        }
        Ok(state)
    }

    /// Remove the record for `date`. Any stored result stays.
    pub async fn delete(&self, date: NaiveDate) -> Result<(), VoteError> {
        let _guard = self.locks.acquire(date).await;
        if !self.store.delete(date).await? {
            return Err(VoteError::not_found(format!("No daily menu for {date}")));
        }
        info!(%date, "daily menu deleted");
        Ok(())
    }

    pub async fn get_result(&self, date: NaiveDate) -> Result<DailyResult, VoteError> {
        self.store
            .get_result(date)
            .await?
            .ok_or_else(|| VoteError::not_found(format!("No result for {date}")))
    }

    pub async fn list_results(&self, limit: i64) -> Result<Vec<DailyResult>, VoteError> {
        self.store.list_results(limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::http::StatusCode;

    use crate::models::daily_menu::MenuStatus;
    use crate::routes::retry_on_conflict;
    use crate::store::memory::{MemoryDailyMenuStore, MemoryFoodCatalog};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 2).unwrap()
    }

    fn service() -> DailyMenuService {
        DailyMenuService::new(
            Arc::new(MemoryDailyMenuStore::new()),
            Arc::new(MemoryFoodCatalog::with_foods([
                (1, "Bibimbap"),
                (2, "Kimchi stew"),
                (3, "Fried rice"),
            ])),
        )
    }

    fn packs(ids: &[&[i32]]) -> Vec<PackRequest> {
        ids.iter()
            .map(|ids| PackRequest { food_ids: ids.to_vec() })
            .collect()
    }

    fn catalog() -> Arc<MemoryFoodCatalog> {
        Arc::new(MemoryFoodCatalog::with_foods([(1, "Bibimbap"), (2, "Kimchi stew")]))
    }

    /// Store whose every read races with another writer: the record is
    /// rewritten right after it is fetched, so the copy handed out is stale.
    struct RacingStore(Arc<MemoryDailyMenuStore>);

    #[async_trait]
    impl DailyMenuStore for RacingStore {
        async fn get(&self, date: NaiveDate) -> Result<Option<DailyMenuState>, VoteError> {
            let fetched = self.0.get(date).await?;
            if let Some(state) = &fetched {
                self.0.save(state).await?;
            }
            Ok(fetched)
        }

        async fn insert_if_absent(
            &self,
            state: &DailyMenuState,
        ) -> Result<DailyMenuState, VoteError> {
            self.0.insert_if_absent(state).await
        }

        async fn save(&self, state: &DailyMenuState) -> Result<DailyMenuState, VoteError> {
            self.0.save(state).await
        }

        async fn save_with_result(
            &self,
            state: &DailyMenuState,
            result: &DailyResult,
        ) -> Result<DailyMenuState, VoteError> {
            self.0.save_with_result(state, result).await
        }

        async fn delete(&self, date: NaiveDate) -> Result<bool, VoteError> {
            self.0.delete(date).await
        }

        async fn get_result(&self, date: NaiveDate) -> Result<Option<DailyResult>, VoteError> {
            self.0.get_result(date).await
        }

        async fn list_results(&self, limit: i64) -> Result<Vec<DailyResult>, VoteError> {
            self.0.list_results(limit).await
        }

        async fn ping(&self) -> anyhow::Result<()> {
            self.0.ping().await
        }
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let svc = service();
        let first = svc.get_or_create(date()).await.unwrap();
        assert_eq!(first.status, MenuStatus::Idle);
        assert!(first.vote_options.is_empty());
        assert!(first.voted_users.is_empty());

        let second = svc.get_or_create(date()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_start_voting_builds_packs_and_replaces_previous() {
        let svc = service();
        let state = svc.start_voting(date(), &packs(&[&[1], &[2, 3]])).await.unwrap();
        assert_eq!(state.status, MenuStatus::Voting);
        assert_eq!(state.vote_options.len(), 2);
        assert!(state.vote_options.iter().all(|p| p.vote_count == 0));

        svc.cast_vote(date(), "u1", 0).await.unwrap();
        let state = svc.start_voting(date(), &packs(&[&[3]])).await.unwrap();
        assert_eq!(state.vote_options.len(), 1);
        assert_eq!(state.vote_options[0].display_name, "Fried rice");
        assert!(state.voted_users.is_empty());
    }

    #[tokio::test]
    async fn test_start_voting_unknown_food_is_not_found() {
        let svc = service();
        let err = svc.start_voting(date(), &packs(&[&[1], &[99]])).await.unwrap_err();
        assert!(matches!(err, VoteError::NotFound(ref m) if m.contains("99")));
        // Nothing was written
        assert!(svc.store().get(date()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_voting_rejected_on_hidden_date() {
        let svc = service();
        svc.set_visibility(date(), false).await.unwrap();
        let err = svc.start_voting(date(), &packs(&[&[1]])).await.unwrap_err();
        assert!(matches!(err, VoteError::Validation(_)));
    }

    #[tokio::test]
    async fn test_hidden_date_rejects_round_before_food_lookup() {
        let svc = service();
        svc.set_visibility(date(), false).await.unwrap();
        let err = svc.start_voting(date(), &packs(&[&[99]])).await.unwrap_err();
        assert!(matches!(err, VoteError::Validation(_)));
    }

    #[tokio::test]
    async fn test_stale_write_is_a_conflict() {
        let shared = Arc::new(MemoryDailyMenuStore::new());
        let writer = DailyMenuService::new(shared.clone(), catalog());
        let racing = DailyMenuService::new(Arc::new(RacingStore(shared.clone())), catalog());

        let started = writer.start_voting(date(), &packs(&[&[1], &[2]])).await.unwrap();
        let err = racing.cast_vote(date(), "u1", 0).await.unwrap_err();
        assert!(err.is_conflict());

        let err = retry_on_conflict(3, || racing.cast_vote(date(), "u1", 0))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(err.status_code(), StatusCode::CONFLICT);

        // The losing vote never landed
        let stored = shared.get(date()).await.unwrap().unwrap();
        assert_eq!(stored.total_votes(), 0);
        assert!(stored.version > started.version);
    }

    #[tokio::test]
    async fn test_unchanged_state_is_not_written() {
        let svc = service();
        let created = svc.get_or_create(date()).await.unwrap();
        let (state, (), written) = svc.mutate(date(), false, |_| Ok(())).await.unwrap();
        assert!(!written);
        assert_eq!(state.version, created.version);

        let shown = svc.set_visibility(date(), true).await.unwrap();
        assert_eq!(shown.version, created.version);

        let set = svc.admin_set_food(date(), 2).await.unwrap();
        assert_eq!(set.version, created.version + 1);
        let again = svc.admin_set_food(date(), 2).await.unwrap();
        assert_eq!(again.version, set.version);
    }

    #[tokio::test]
    async fn test_vote_on_missing_record_is_not_found() {
        let svc = service();
        let err = svc.cast_vote(date(), "u1", 0).await.unwrap_err();
        assert!(matches!(err, VoteError::NotFound(_)));
        let err = svc.cancel_vote(date(), "u1").await.unwrap_err();
        assert!(matches!(err, VoteError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_vote_leaves_stored_state_unchanged() {
        let svc = service();
        let before = svc.start_voting(date(), &packs(&[&[1], &[2]])).await.unwrap();
        let err = svc.cast_vote(date(), "u1", 5).await.unwrap_err();
        assert!(matches!(err, VoteError::Validation(_)));
        assert_eq!(svc.get_or_create(date()).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_votes_then_close_writes_matching_result() {
        let svc = service();
        svc.start_voting(date(), &packs(&[&[1], &[2, 3]])).await.unwrap();
        svc.cast_vote(date(), "u1", 0).await.unwrap();
        svc.cast_vote(date(), "u2", 1).await.unwrap();
        svc.cast_vote(date(), "u3", 1).await.unwrap();
        svc.cast_vote(date(), "u1", 1).await.unwrap();
        svc.cancel_vote(date(), "u2").await.unwrap();

        let closed = svc.close_voting(date()).await.unwrap();
        assert_eq!(closed.status, MenuStatus::Closed);
        assert_eq!(closed.winning_food_id, Some(2));

        let result = svc.get_result(date()).await.unwrap();
        assert_eq!(result.total_votes, closed.total_votes());
        assert_eq!(result.total_votes, 2);
        assert_eq!(result.winning_food_ids, vec![2, 3]);
        assert_eq!(result.winning_food_name, "Kimchi stew + Fried rice");
    }

    #[tokio::test]
    async fn test_reclosing_a_restarted_day_overwrites_result() {
        let svc = service();
        svc.start_voting(date(), &packs(&[&[1]])).await.unwrap();
        svc.close_voting(date()).await.unwrap();

        svc.start_voting(date(), &packs(&[&[2], &[3]])).await.unwrap();
        svc.cast_vote(date(), "u1", 1).await.unwrap();
        svc.close_voting(date()).await.unwrap();

        let results = svc.list_results(10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].winning_food_id, 3);
    }

    #[tokio::test]
    async fn test_admin_set_food() {
        let svc = service();
        svc.start_voting(date(), &packs(&[&[1]])).await.unwrap();
        let state = svc.admin_set_food(date(), 2).await.unwrap();
        assert_eq!(state.status, MenuStatus::AdminSet);
        assert_eq!(state.admin_set_food_id, Some(2));
        assert!(state.vote_options.is_empty());

        let err = svc.admin_set_food(date(), 404).await.unwrap_err();
        assert!(matches!(err, VoteError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_visibility_does_not_touch_status() {
        let svc = service();
        svc.start_voting(date(), &packs(&[&[1]])).await.unwrap();
        let hidden = svc.set_visibility(date(), false).await.unwrap();
        assert_eq!(hidden.status, MenuStatus::Voting);
        assert!(!hidden.is_visible);
        assert!(svc.cast_vote(date(), "u1", 0).await.is_err());

        let shown = svc.set_visibility(date(), true).await.unwrap();
        assert_eq!(shown.status, MenuStatus::Voting);
        assert!(svc.cast_vote(date(), "u1", 0).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_keeps_result() {
        let svc = service();
        svc.start_voting(date(), &packs(&[&[1]])).await.unwrap();
        svc.close_voting(date()).await.unwrap();

        svc.delete(date()).await.unwrap();
        assert!(svc.store().get(date()).await.unwrap().is_none());
        assert!(svc.get_result(date()).await.is_ok());

        let err = svc.delete(date()).await.unwrap_err();
        assert!(matches!(err, VoteError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_each_write_bumps_version() {
        let svc = service();
        let created = svc.get_or_create(date()).await.unwrap();
        let started = svc.start_voting(date(), &packs(&[&[1]])).await.unwrap();
        let voted = svc.cast_vote(date(), "u1", 0).await.unwrap();
        assert_eq!(started.version, created.version + 1);
        assert_eq!(voted.version, started.version + 1);
    }

    #[tokio::test]
    async fn test_repeated_vote_is_not_written() {
        let svc = service();
        svc.start_voting(date(), &packs(&[&[1]])).await.unwrap();
        let first = svc.cast_vote(date(), "u1", 0).await.unwrap();
        let again = svc.cast_vote(date(), "u1", 0).await.unwrap();
        assert_eq!(again.version, first.version);
        assert_eq!(again.total_votes(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_votes_are_not_lost() {
        let svc = Arc::new(service());
        svc.start_voting(date(), &packs(&[&[1], &[2], &[3]])).await.unwrap();

        let n = 50;
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..n {
            let svc = svc.clone();
            tasks.spawn(async move {
                svc.cast_vote(date(), &format!("user-{i}"), (i % 3) as i64).await
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap().unwrap();
        }

        let state = svc.get_or_create(date()).await.unwrap();
        assert_eq!(state.total_votes(), n);
        assert_eq!(state.voted_users.len(), n as usize);
    }

    #[tokio::test]
    async fn test_date_locks_are_swept() {
        let locks = DateLocks::default();
        for day in 1..=(LOCK_SWEEP_THRESHOLD as u32 + 2) {
            let d = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap() + chrono::Duration::days(day.into());
            drop(locks.acquire(d).await);
        }
        assert!(locks.locks.lock().await.len() <= LOCK_SWEEP_THRESHOLD + 1);
    }
}
