//! ObjectiveStore: OKRs of the active team
//!
//! The store follows the team scope published by the TeamStore. On every
//! change of the active team it drops its subscription, clears the snapshot,
//! resubscribes and refetches.

use crate::sync::backend::Backend;
use crate::sync::error::{require_text, SyncError, SyncResult};
use crate::sync::listener::SyncListener;
use crate::sync::objective::api::ObjectiveApi;
use crate::sync::objective::models::{
    validate_progress, NewObjective, Objective, ObjectivePatch, ObjectiveSnapshot,
};
use crate::sync::reconcile::{ChangeEvent, FoldOutcome, ReplayBuffer, Snapshot};
use crate::sync::store::{spawn_scope_watch, subscribe_tables, ChangeSink, ScopedStore, StoreCore};
use crate::sync::types::{to_row, SortOrder, StoreKind, Table};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

const OKRS_LOAD_FAILED: &str = "Failed to fetch OKRs";
const OKRS_SUBSCRIBE_FAILED: &str = "Failed to subscribe to OKR changes";
const OKR_ADDED: &str = "OKR added successfully";
const OKR_ADD_FAILED: &str = "Failed to add OKR";
const OKR_UPDATED: &str = "OKR updated successfully";
const OKR_UPDATE_FAILED: &str = "Failed to update OKR";
const PROGRESS_UPDATED: &str = "Progress updated successfully";
const PROGRESS_UPDATE_FAILED: &str = "Failed to update progress";
const OKR_DELETED: &str = "OKR deleted successfully";
const OKR_DELETE_FAILED: &str = "Failed to delete OKR";

struct ObjectiveState {
    team_id: Option<String>,
    objectives: Snapshot<Objective>,
    /// Notifications that arrive while a fetch is in flight
    replay: ReplayBuffer,
    is_loading: bool,
}

struct ObjectiveStoreInner {
    core: StoreCore,
    api: ObjectiveApi,
    backend: Arc<dyn Backend>,
    state: RwLock<ObjectiveState>,
}

#[derive(Clone)]
pub struct ObjectiveStore {
    inner: Arc<ObjectiveStoreInner>,
}

impl fmt::Debug for ObjectiveStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectiveStore")
            .field("closed", &self.inner.core.is_closed())
            .finish_non_exhaustive()
    }
}

impl ObjectiveStore {
    /// Loads the objectives of the current scope and follows later changes of it
    pub async fn open(
        backend: Arc<dyn Backend>,
        mut scope: watch::Receiver<Option<String>>,
        listener: Arc<dyn SyncListener>,
    ) -> SyncResult<Self> {
        let team_id = scope.borrow_and_update().clone();
        info!("[ObjectiveStore] opening store, team {:?}", team_id);

        let inner = Arc::new(ObjectiveStoreInner {
            core: StoreCore::new(StoreKind::Objectives, "ObjectiveStore", listener),
            api: ObjectiveApi::new(backend.clone()),
            backend,
            state: RwLock::new(ObjectiveState {
                team_id: None,
                objectives: Snapshot::new(SortOrder::Ascending),
                replay: ReplayBuffer::default(),
                is_loading: false,
            }),
        });

        // a failed initial load stays on the snapshot; refresh() retries it
        let _ = ObjectiveStoreInner::load_scope(&inner, team_id).await;
        let watcher = spawn_scope_watch(Arc::downgrade(&inner), scope);
        inner.core.set_watcher(watcher).await;
        Ok(Self { inner })
    }

    /// Refetches the objectives of the active team, oldest first
    pub async fn list_objectives(&self) -> SyncResult<Vec<Objective>> {
        self.inner.core.ensure_open()?;
        let team_id = self.inner.active_team_id().await?;
        self.inner.fetch(&team_id).await
    }

    /// Creates an objective with progress 0
    pub async fn add_objective(&self, title: &str, description: Option<&str>) -> SyncResult<Objective> {
        let inner = &self.inner;
        inner.core.ensure_open()?;
        if let Err(e) = require_text("objective title", title) {
            return inner.core.fail(OKR_ADD_FAILED, e).await;
        }
        let team_id = inner.active_team_id().await?;

        let new_objective = NewObjective {
            team_id: team_id.clone(),
            title: title.trim().to_string(),
            description: description
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string),
            progress: 0.0,
        };
        match inner.api.insert_objective(&new_objective).await {
            Ok(objective) => {
                let local = objective.clone();
                inner
                    .in_scope(&team_id, move |objectives| objectives.upsert(local))
                    .await;
                inner.core.succeed(OKR_ADDED).await;
                Ok(objective)
            }
            Err(e) => inner.core.fail(OKR_ADD_FAILED, SyncError::backend(e)).await,
        }
    }

    pub async fn update_objective(&self, id: &str, patch: ObjectivePatch) -> SyncResult<()> {
        self.patch_objective(id, patch, OKR_UPDATED, OKR_UPDATE_FAILED)
            .await
    }

    /// Sets the progress of one objective; values outside `[0, 1]` are rejected
    pub async fn update_progress(&self, id: &str, value: f64) -> SyncResult<()> {
        self.inner.core.ensure_open()?;
        if let Err(e) = validate_progress(value) {
            return self.inner.core.fail(PROGRESS_UPDATE_FAILED, e).await;
        }
        self.patch_objective(
            id,
            ObjectivePatch::progress(value),
            PROGRESS_UPDATED,
            PROGRESS_UPDATE_FAILED,
        )
        .await
    }

    async fn patch_objective(
        &self,
        id: &str,
        patch: ObjectivePatch,
        ok_message: &str,
        fail_message: &str,
    ) -> SyncResult<()> {
        let inner = &self.inner;
        inner.core.ensure_open()?;
        if let Err(e) = patch.validate() {
            return inner.core.fail(fail_message, e).await;
        }
        let team_id = inner.active_team_id().await?;
        let fields = to_row(&patch).map_err(SyncError::backend)?;

        if let Err(e) = inner.api.update_objective(id, &patch).await {
            return inner.core.fail(fail_message, SyncError::backend(e)).await;
        }
        let patched = inner
            .in_scope(&team_id, |objectives| objectives.patch(id, &fields))
            .await;
        if let Some(Err(e)) = patched {
            warn!("[ObjectiveStore] local patch of OKR {} failed: {:#}", id, e);
        }
        inner.core.succeed(ok_message).await;
        Ok(())
    }

    pub async fn delete_objective(&self, id: &str) -> SyncResult<()> {
        let inner = &self.inner;
        inner.core.ensure_open()?;
        let team_id = inner.active_team_id().await?;

        match inner.api.delete_objective(id).await {
            Ok(()) => {
                inner
                    .in_scope(&team_id, |objectives| objectives.remove(id))
                    .await;
                inner.core.succeed(OKR_DELETED).await;
                Ok(())
            }
            Err(e) => inner.core.fail(OKR_DELETE_FAILED, SyncError::backend(e)).await,
        }
    }

    pub async fn refresh(&self) -> SyncResult<()> {
        self.list_objectives().await.map(|_| ())
    }

    /// Local snapshot, oldest first
    pub async fn objectives(&self) -> Vec<Objective> {
        self.inner.state.read().await.objectives.list()
    }

    pub async fn get(&self, id: &str) -> Option<Objective> {
        self.inner.state.read().await.objectives.get(id).cloned()
    }

    pub async fn team_id(&self) -> Option<String> {
        self.inner.state.read().await.team_id.clone()
    }

    pub async fn snapshot(&self) -> ObjectiveSnapshot {
        let error = self.inner.core.last_error().await;
        let state = self.inner.state.read().await;
        ObjectiveSnapshot {
            objectives: state.objectives.list(),
            is_loading: state.is_loading,
            error,
        }
    }

    pub async fn shutdown(&self) {
        self.inner.core.close().await;
    }
}

impl ObjectiveStoreInner {
    async fn active_team_id(&self) -> SyncResult<String> {
        self.state
            .read()
            .await
            .team_id
            .clone()
            .ok_or_else(|| SyncError::ContextMisuse("No team selected".to_string()))
    }

    /// Runs `f` on the snapshot unless the scope moved away from `team_id`
    /// while the remote call was in flight
    async fn in_scope<R>(
        &self,
        team_id: &str,
        f: impl FnOnce(&mut Snapshot<Objective>) -> R,
    ) -> Option<R> {
        let mut state = self.state.write().await;
        if state.team_id.as_deref() != Some(team_id) {
            debug!("[ObjectiveStore] scope changed during write, skipping local update");
            return None;
        }
        Some(f(&mut state.objectives))
    }

    async fn fetch(&self, team_id: &str) -> SyncResult<Vec<Objective>> {
        self.state.write().await.replay.begin();
        let fetched = self.api.list_objectives(team_id).await;

        let mut state = self.state.write().await;
        let replay = state.replay.finish();
        state.is_loading = false;
        match fetched {
            Ok(objectives) => {
                let listed = if state.team_id.as_deref() == Some(team_id) {
                    state.objectives.replace_all(objectives);
                    for event in &replay {
                        if let Err(e) = state.objectives.apply(event, Some(team_id)) {
                            warn!("[ObjectiveStore] dropping replayed change: {:#}", e);
                        }
                    }
                    state.objectives.list()
                } else {
                    objectives
                };
                drop(state);
                self.core.clear_error().await;
                self.core.changed().await;
                Ok(listed)
            }
            Err(e) => {
                drop(state);
                self.core.fail(OKRS_LOAD_FAILED, SyncError::backend(e)).await
            }
        }
    }

    async fn load_scope(this: &Arc<Self>, team_id: Option<String>) -> SyncResult<()> {
        this.core.stop_tasks().await;
        {
            let mut state = this.state.write().await;
            state.team_id = team_id.clone();
            state.objectives.clear();
            state.is_loading = team_id.is_some();
        }
        let Some(team_id) = team_id else {
            this.core.changed().await;
            return Ok(());
        };

        if let Err(e) = subscribe_tables(&this.core, this.backend.as_ref(), this, &[Table::Okrs]).await {
            this.state.write().await.is_loading = false;
            return this.core.fail(OKRS_SUBSCRIBE_FAILED, SyncError::backend(e)).await;
        }
        this.fetch(&team_id).await.map(|_| ())
    }
}

#[async_trait]
impl ChangeSink for ObjectiveStoreInner {
    fn core(&self) -> &StoreCore {
        &self.core
    }

    async fn apply_change(&self, event: ChangeEvent) {
        if self.core.is_closed() || event.table != Table::Okrs {
            return;
        }
        let result = {
            let mut state = self.state.write().await;
            let Some(team_id) = state.team_id.clone() else { return };
            state.replay.record(&event);
            state.objectives.apply(&event, Some(&team_id))
        };
        match result {
            Ok(FoldOutcome::Missing) => warn!(
                "[ObjectiveStore] update for unknown OKR {:?}, refresh() to resync",
                event.row_id()
            ),
            Ok(outcome) if outcome.changed() => self.core.changed().await,
            Ok(_) => {}
            Err(e) => warn!("[ObjectiveStore] dropping change: {:#}", e),
        }
    }
}

#[async_trait]
impl ScopedStore for ObjectiveStoreInner {
    async fn rescope(self: Arc<Self>, team_id: Option<String>) {
        // failures are already recorded and surfaced by load_scope
        let _ = Self::load_scope(&self, team_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::backend::SqliteBackend;
    use crate::sync::team::{TeamStore, DEFAULT_TEAM_ID};
    use crate::sync::testing::{eventually, init_test_logger, InterleavedBackend, RecordingListener};
    use crate::sync::types::Row;
    use serde_json::json;

    const OTHER_TEAM_ID: &str = "00000000-0000-0000-0000-000000000002";

    struct Fixture {
        backend: SqliteBackend,
        teams: TeamStore,
        store: ObjectiveStore,
        listener: Arc<RecordingListener>,
    }

    async fn fixture() -> Fixture {
        init_test_logger();
        let backend = SqliteBackend::in_memory().await.unwrap();
        let shared: Arc<dyn Backend> = Arc::new(backend.clone());
        let listener = Arc::new(RecordingListener::default());
        let teams = TeamStore::open(shared.clone(), DEFAULT_TEAM_ID, listener.clone())
            .await
            .unwrap();
        let store = ObjectiveStore::open(shared, teams.scope(), listener.clone())
            .await
            .unwrap();
        Fixture {
            backend,
            teams,
            store,
            listener,
        }
    }

    fn row(value: serde_json::Value) -> Row {
        value.as_object().unwrap().clone()
    }

    async fn insert_team(backend: &SqliteBackend, id: &str) {
        backend
            .insert(
                Table::Teams,
                row(json!({"id": id, "name": "Other", "icon_type": "emoji", "icon_value": null})),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn added_objective_starts_at_zero_progress() {
        let f = fixture().await;

        let okr = f.store.add_objective("Ship v1", Some("first release")).await.unwrap();
        assert_eq!(okr.progress, 0.0);
        assert_eq!(okr.team_id, DEFAULT_TEAM_ID);
        assert_eq!(okr.description.as_deref(), Some("first release"));
        assert_eq!(f.store.objectives().await, vec![okr]);
        assert_eq!(f.listener.successes(), vec![OKR_ADDED.to_string()]);
    }

    #[tokio::test]
    async fn objectives_are_listed_oldest_first() {
        let f = fixture().await;
        for title in ["A", "B", "C"] {
            f.store.add_objective(title, None).await.unwrap();
        }
        let titles: Vec<String> = f
            .store
            .list_objectives()
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.title)
            .collect();
        assert_eq!(titles, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn progress_reads_back_and_out_of_range_is_rejected() {
        let f = fixture().await;
        let okr = f.store.add_objective("Ship v1", None).await.unwrap();

        f.store.update_progress(&okr.id, 0.5).await.unwrap();
        assert_eq!(f.store.get(&okr.id).await.unwrap().progress, 0.5);
        let fetched = f.store.list_objectives().await.unwrap();
        assert_eq!(fetched[0].progress, 0.5);

        for bad in [1.2, -0.1, f64::INFINITY] {
            let err = f.store.update_progress(&okr.id, bad).await.unwrap_err();
            assert!(err.is_validation());
        }
        assert_eq!(f.store.get(&okr.id).await.unwrap().progress, 0.5);
        assert_eq!(
            f.listener.failures(),
            vec![PROGRESS_UPDATE_FAILED; 3]
        );
    }

    #[tokio::test]
    async fn update_objective_merges_fields() {
        let f = fixture().await;
        let okr = f.store.add_objective("Ship v1", Some("draft")).await.unwrap();

        f.store
            .update_objective(
                &okr.id,
                ObjectivePatch {
                    title: Some("Ship v1.0".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let local = f.store.get(&okr.id).await.unwrap();
        assert_eq!(local.title, "Ship v1.0");
        assert_eq!(local.description.as_deref(), Some("draft"));
    }

    #[tokio::test]
    async fn referenced_objective_cannot_be_deleted() {
        let f = fixture().await;
        let okr = f.store.add_objective("Ship v1", None).await.unwrap();
        let bob = f.teams.add_member("Bob").await.unwrap();
        f.backend
            .insert(
                Table::WeeklyGoals,
                row(json!({
                    "team_id": DEFAULT_TEAM_ID,
                    "okr_id": okr.id,
                    "team_member_id": bob.id,
                    "description": "Write docs",
                    "status": "not_started"
                })),
            )
            .await
            .unwrap();

        let err = f.store.delete_objective(&okr.id).await.unwrap_err();
        assert!(err.is_backend());
        assert!(f.store.get(&okr.id).await.is_some());
        assert!(f.listener.failures().contains(&OKR_DELETE_FAILED.to_string()));
    }

    #[tokio::test]
    async fn delete_removes_locally() {
        let f = fixture().await;
        let okr = f.store.add_objective("Ship v1", None).await.unwrap();
        f.store.delete_objective(&okr.id).await.unwrap();
        assert!(f.store.objectives().await.is_empty());
    }

    #[tokio::test]
    async fn other_teams_never_enter_the_snapshot() {
        let f = fixture().await;
        insert_team(&f.backend, OTHER_TEAM_ID).await;
        f.backend
            .insert(Table::Okrs, row(json!({"team_id": OTHER_TEAM_ID, "title": "Foreign", "progress": 0.0})))
            .await
            .unwrap();
        let mine = f.store.add_objective("Mine", None).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let objectives = f.store.list_objectives().await.unwrap();
        assert_eq!(objectives, vec![mine.clone()]);
        assert!(f
            .store
            .objectives()
            .await
            .iter()
            .all(|o| o.team_id == DEFAULT_TEAM_ID));

        // moving a row to another team evicts it
        f.backend
            .update(Table::Okrs, &mine.id, row(json!({"team_id": OTHER_TEAM_ID})))
            .await
            .unwrap();
        let s = &f.store;
        assert!(eventually(|| async move { s.objectives().await.is_empty() }).await);
    }

    #[tokio::test]
    async fn remote_changes_are_folded() {
        let f = fixture().await;
        let created = f
            .backend
            .insert(Table::Okrs, row(json!({"team_id": DEFAULT_TEAM_ID, "title": "Remote", "progress": 0.0})))
            .await
            .unwrap();
        let id = created["id"].as_str().unwrap().to_string();
        let s = &f.store;
        assert!(eventually(|| async move { s.objectives().await.len() == 1 }).await);

        f.backend
            .update(Table::Okrs, &id, row(json!({"progress": 0.75})))
            .await
            .unwrap();
        let id_ref = &id;
        assert!(
            eventually(|| async move { s.get(id_ref).await.map(|o| o.progress) == Some(0.75) })
                .await
        );
    }

    #[tokio::test]
    async fn objective_written_during_initial_fetch_is_kept() {
        init_test_logger();
        let backend = Arc::new(InterleavedBackend::new().await.unwrap());
        let listener = Arc::new(RecordingListener::default());
        let teams = TeamStore::open(backend.clone(), DEFAULT_TEAM_ID, listener.clone())
            .await
            .unwrap();
        backend.insert_during_select(
            Table::Okrs,
            row(json!({"team_id": DEFAULT_TEAM_ID, "title": "From elsewhere", "progress": 0.0})),
        );
        let store = ObjectiveStore::open(backend.clone(), teams.scope(), listener)
            .await
            .unwrap();

        let s = &store;
        assert!(eventually(|| async move { s.objectives().await.len() == 1 }).await);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(store.objectives().await[0].title, "From elsewhere");
        assert!(!store.snapshot().await.is_loading);
    }

    #[tokio::test]
    async fn commands_without_team_are_context_errors() {
        init_test_logger();
        let backend: Arc<dyn Backend> = Arc::new(SqliteBackend::in_memory().await.unwrap());
        let (_tx, rx) = watch::channel(None);
        let store = ObjectiveStore::open(backend, rx, Arc::new(RecordingListener::default()))
            .await
            .unwrap();

        assert!(store.add_objective("x", None).await.unwrap_err().is_context_misuse());
        assert!(store.list_objectives().await.unwrap_err().is_context_misuse());
        assert!(store.objectives().await.is_empty());
    }

    #[tokio::test]
    async fn follows_the_active_team() {
        init_test_logger();
        let backend = SqliteBackend::in_memory().await.unwrap();
        insert_team(&backend, DEFAULT_TEAM_ID).await;
        insert_team(&backend, OTHER_TEAM_ID).await;
        for (team, title) in [(DEFAULT_TEAM_ID, "First"), (OTHER_TEAM_ID, "Second")] {
            backend
                .insert(Table::Okrs, row(json!({"team_id": team, "title": title, "progress": 0.0})))
                .await
                .unwrap();
        }

        let (tx, rx) = watch::channel(Some(DEFAULT_TEAM_ID.to_string()));
        let store = ObjectiveStore::open(
            Arc::new(backend.clone()),
            rx,
            Arc::new(RecordingListener::default()),
        )
        .await
        .unwrap();
        assert_eq!(store.objectives().await[0].title, "First");

        tx.send(Some(OTHER_TEAM_ID.to_string())).unwrap();
        let s = &store;
        assert!(
            eventually(|| async move {
                let titles: Vec<String> = s.objectives().await.into_iter().map(|o| o.title).collect();
                titles == vec!["Second".to_string()]
            })
            .await
        );

        tx.send(None).unwrap();
        assert!(eventually(|| async move { s.team_id().await.is_none() }).await);
        assert!(store.objectives().await.is_empty());
    }

    #[tokio::test]
    async fn commands_after_shutdown_are_context_errors() {
        let f = fixture().await;
        f.store.shutdown().await;
        assert!(f.store.add_objective("x", None).await.unwrap_err().is_context_misuse());
        assert!(f.store.update_progress("id", 0.5).await.unwrap_err().is_context_misuse());
    }
}
