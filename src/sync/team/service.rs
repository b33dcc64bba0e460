//! TeamStore: the active team and its members
//!
//! The team is fetched (or created) under a well-known id when the store
//! opens. Its id is published on a watch channel; objective and goal stores
//! scope themselves by it.

use crate::sync::backend::Backend;
use crate::sync::error::{require_text, SyncError, SyncResult};
use crate::sync::listener::SyncListener;
use crate::sync::reconcile::{ChangeEvent, FoldOutcome, ReplayBuffer, Snapshot};
use crate::sync::store::{subscribe_tables, ChangeSink, StoreCore};
use crate::sync::team::api::TeamApi;
use crate::sync::team::models::{Member, NewMember, NewTeam, Team, TeamPatch, TeamSnapshot};
use crate::sync::types::{to_row, Row, SortOrder, StoreKind, Table};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

const TEAM_LOAD_FAILED: &str = "Failed to fetch or create team";
const MEMBERS_LOAD_FAILED: &str = "Failed to fetch team members";
const MEMBER_ADDED: &str = "Team member added successfully";
const MEMBER_ADD_FAILED: &str = "Failed to add team member";
const MEMBER_UPDATED: &str = "Team member updated successfully";
const MEMBER_UPDATE_FAILED: &str = "Failed to update team member";
const MEMBER_DELETED: &str = "Team member deleted successfully";
const MEMBER_DELETE_FAILED: &str = "Failed to delete team member";
const TEAM_UPDATED: &str = "Team updated successfully";
const TEAM_UPDATE_FAILED: &str = "Failed to update team";

struct TeamState {
    /// Holds at most the team with the well-known id
    team: Snapshot<Team>,
    members: Snapshot<Member>,
    /// Member notifications that arrive while the member list is fetched
    replay: ReplayBuffer,
    is_loading: bool,
}

struct TeamStoreInner {
    core: StoreCore,
    api: TeamApi,
    team_id: String,
    state: RwLock<TeamState>,
    scope_tx: watch::Sender<Option<String>>,
}

/// Store for the single active team and its member list
#[derive(Clone)]
pub struct TeamStore {
    inner: Arc<TeamStoreInner>,
}

impl fmt::Debug for TeamStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeamStore")
            .field("team_id", &self.inner.team_id)
            .field("closed", &self.inner.core.is_closed())
            .finish_non_exhaustive()
    }
}

impl TeamStore {
    /// Subscribes to team and member changes, then loads the team
    ///
    /// A failed load does not fail the store: the error is surfaced through
    /// the listener and [`TeamStore::snapshot`], and `refresh()` retries.
    pub async fn open(
        backend: Arc<dyn Backend>,
        team_id: &str,
        listener: Arc<dyn SyncListener>,
    ) -> SyncResult<Self> {
        info!("[TeamStore] opening store for team {}", team_id);
        let (scope_tx, _) = watch::channel(None);
        let inner = Arc::new(TeamStoreInner {
            core: StoreCore::new(StoreKind::Team, "TeamStore", listener),
            api: TeamApi::new(backend.clone()),
            team_id: team_id.to_string(),
            state: RwLock::new(TeamState {
                team: Snapshot::new(SortOrder::Ascending),
                members: Snapshot::new(SortOrder::Ascending),
                replay: ReplayBuffer::default(),
                is_loading: true,
            }),
            scope_tx,
        });

        // subscribe first: anything written during the initial fetch is replayed
        // into an idempotent fold
        subscribe_tables(&inner.core, backend.as_ref(), &inner, &[Table::Teams, Table::TeamMembers])
            .await
            .map_err(SyncError::backend)?;

        let store = Self { inner };
        // failures are recorded on the snapshot; refresh() retries
        let _ = store.refresh().await;
        Ok(store)
    }

    /// Reads the team with the well-known id, creating it when absent
    ///
    /// A failed read falls through to the create; only when both fail is a
    /// backend error returned.
    pub async fn get_or_create_team(&self) -> SyncResult<Team> {
        let inner = &self.inner;
        inner.core.ensure_open()?;
        inner.set_loading(true).await;
        let result = inner.get_or_create_team().await;
        inner.set_loading(false).await;
        result
    }

    /// Members of `team_id`, oldest first; replaces the snapshot when
    /// `team_id` is the active team
    pub async fn list_members(&self, team_id: &str) -> SyncResult<Vec<Member>> {
        self.inner.core.ensure_open()?;
        self.inner.list_members(team_id).await
    }

    pub async fn add_member(&self, name: &str) -> SyncResult<Member> {
        let inner = &self.inner;
        inner.core.ensure_open()?;
        if let Err(e) = require_text("member name", name) {
            return inner.core.fail(MEMBER_ADD_FAILED, e).await;
        }
        let team_id = inner.active_team_id().await?;

        let new_member = NewMember {
            team_id,
            name: name.trim().to_string(),
        };
        match inner.api.insert_member(&new_member).await {
            Ok(member) => {
                inner.state.write().await.members.upsert(member.clone());
                inner.core.succeed(MEMBER_ADDED).await;
                Ok(member)
            }
            Err(e) => inner.core.fail(MEMBER_ADD_FAILED, SyncError::backend(e)).await,
        }
    }

    pub async fn update_member(&self, id: &str, name: &str) -> SyncResult<()> {
        let inner = &self.inner;
        inner.core.ensure_open()?;
        if let Err(e) = require_text("member name", name) {
            return inner.core.fail(MEMBER_UPDATE_FAILED, e).await;
        }
        inner.active_team_id().await?;

        let name = name.trim();
        match inner.api.update_member(id, name).await {
            Ok(()) => {
                let mut fields = Row::new();
                fields.insert("name".to_string(), Value::String(name.to_string()));
                if let Err(e) = inner.state.write().await.members.patch(id, &fields) {
                    warn!("[TeamStore] local patch of member {} failed: {:#}", id, e);
                }
                inner.core.succeed(MEMBER_UPDATED).await;
                Ok(())
            }
            Err(e) => inner.core.fail(MEMBER_UPDATE_FAILED, SyncError::backend(e)).await,
        }
    }

    pub async fn delete_member(&self, id: &str) -> SyncResult<()> {
        let inner = &self.inner;
        inner.core.ensure_open()?;
        inner.active_team_id().await?;

        match inner.api.delete_member(id).await {
            Ok(()) => {
                inner.state.write().await.members.remove(id);
                inner.core.succeed(MEMBER_DELETED).await;
                Ok(())
            }
            Err(e) => inner.core.fail(MEMBER_DELETE_FAILED, SyncError::backend(e)).await,
        }
    }

    /// Renames the team or changes its icon
    pub async fn update_team(&self, patch: TeamPatch) -> SyncResult<Team> {
        let inner = &self.inner;
        inner.core.ensure_open()?;
        if patch.is_empty() {
            let err = SyncError::Validation("team update has no fields".to_string());
            return inner.core.fail(TEAM_UPDATE_FAILED, err).await;
        }
        if let Some(name) = &patch.name {
            if let Err(e) = require_text("team name", name) {
                return inner.core.fail(TEAM_UPDATE_FAILED, e).await;
            }
        }
        let team_id = inner.active_team_id().await?;

        if let Err(e) = inner.api.update_team(&team_id, &patch).await {
            return inner.core.fail(TEAM_UPDATE_FAILED, SyncError::backend(e)).await;
        }

        let fields = to_row(&patch).map_err(SyncError::backend)?;
        let updated = {
            let mut state = inner.state.write().await;
            if let Err(e) = state.team.patch(&team_id, &fields) {
                warn!("[TeamStore] local patch of team {} failed: {:#}", team_id, e);
            }
            state.team.get(&team_id).cloned()
        };
        inner.core.succeed(TEAM_UPDATED).await;
        updated.ok_or_else(|| SyncError::ContextMisuse("No team selected".to_string()))
    }

    /// Refetches team and members, replacing the local snapshot
    pub async fn refresh(&self) -> SyncResult<()> {
        let inner = &self.inner;
        inner.core.ensure_open()?;
        inner.set_loading(true).await;
        let result = inner.reload().await;
        inner.set_loading(false).await;
        inner.core.changed().await;
        result
    }

    pub async fn team(&self) -> Option<Team> {
        let state = self.inner.state.read().await;
        state.team.get(&self.inner.team_id).cloned()
    }

    /// Members of the active team, oldest first
    pub async fn members(&self) -> Vec<Member> {
        self.inner.state.read().await.members.list()
    }

    pub async fn snapshot(&self) -> TeamSnapshot {
        let error = self.inner.core.last_error().await;
        let state = self.inner.state.read().await;
        TeamSnapshot {
            team: state.team.get(&self.inner.team_id).cloned(),
            members: state.members.list(),
            is_loading: state.is_loading,
            error,
        }
    }

    /// Receiver of the active team id; `None` while no team is loaded
    pub fn scope(&self) -> watch::Receiver<Option<String>> {
        self.inner.scope_tx.subscribe()
    }

    /// Ends both subscriptions; later commands fail with a context error
    pub async fn shutdown(&self) {
        self.inner.core.close().await;
    }
}

impl TeamStoreInner {
    async fn set_loading(&self, is_loading: bool) {
        self.state.write().await.is_loading = is_loading;
    }

    async fn get_or_create_team(&self) -> SyncResult<Team> {
        let team = match self.api.fetch_team(&self.team_id).await {
            Ok(Some(team)) => {
                debug!("[TeamStore] found team {}", team.id);
                team
            }
            result => {
                if let Err(e) = result {
                    warn!("[TeamStore] fetch of team {} failed, creating it: {:#}", self.team_id, e);
                } else {
                    info!("[TeamStore] team {} not found, creating default team", self.team_id);
                }
                match self.api.create_team(&NewTeam::default_team(&self.team_id)).await {
                    Ok(team) => team,
                    Err(e) => return self.core.fail(TEAM_LOAD_FAILED, SyncError::backend(e)).await,
                }
            }
        };

        self.state.write().await.team.upsert(team.clone());
        self.publish_scope(Some(team.id.clone()));
        Ok(team)
    }

    async fn list_members(&self, team_id: &str) -> SyncResult<Vec<Member>> {
        if team_id != self.team_id {
            return match self.api.list_members(team_id).await {
                Ok(members) => Ok(members),
                Err(e) => self.core.fail(MEMBERS_LOAD_FAILED, SyncError::backend(e)).await,
            };
        }

        self.state.write().await.replay.begin();
        let fetched = self.api.list_members(team_id).await;

        let mut state = self.state.write().await;
        let replay = state.replay.finish();
        let members = match fetched {
            Ok(members) => members,
            Err(e) => {
                drop(state);
                return self.core.fail(MEMBERS_LOAD_FAILED, SyncError::backend(e)).await;
            }
        };
        state.members.replace_all(members);
        for event in &replay {
            if let Err(e) = state.members.apply(event, Some(&self.team_id)) {
                warn!("[TeamStore] dropping replayed member change: {:#}", e);
            }
        }
        debug!("[TeamStore] {} members in team {}", state.members.len(), team_id);
        Ok(state.members.list())
    }

    /// Team first, then its members
    async fn reload(&self) -> SyncResult<()> {
        let team = self.get_or_create_team().await?;
        self.list_members(&team.id).await?;
        self.core.clear_error().await;
        Ok(())
    }

    async fn active_team_id(&self) -> SyncResult<String> {
        let state = self.state.read().await;
        match state.team.get(&self.team_id) {
            Some(team) => Ok(team.id.clone()),
            None => Err(SyncError::ContextMisuse("No team selected".to_string())),
        }
    }

    fn publish_scope(&self, scope: Option<String>) {
        self.scope_tx.send_if_modified(|current| {
            if *current == scope {
                return false;
            }
            *current = scope;
            true
        });
    }

    async fn fold_team(&self, event: &ChangeEvent) -> anyhow::Result<FoldOutcome> {
        if event.row_id() != Some(self.team_id.as_str()) {
            return Ok(FoldOutcome::Ignored);
        }
        let mut state = self.state.write().await;
        let outcome = state.team.apply(event, None)?;
        match outcome {
            FoldOutcome::Removed => {
                info!("[TeamStore] team {} deleted remotely", self.team_id);
                state.members.clear();
                drop(state);
                self.publish_scope(None);
            }
            FoldOutcome::Inserted => {
                drop(state);
                self.publish_scope(Some(self.team_id.clone()));
            }
            _ => {}
        }
        Ok(outcome)
    }

    async fn fold_member(&self, event: &ChangeEvent) -> anyhow::Result<FoldOutcome> {
        let mut state = self.state.write().await;
        state.replay.record(event);
        state.members.apply(event, Some(&self.team_id))
    }
}

#[async_trait]
impl ChangeSink for TeamStoreInner {
    fn core(&self) -> &StoreCore {
        &self.core
    }

    async fn apply_change(&self, event: ChangeEvent) {
        if self.core.is_closed() {
            return;
        }
        let result = match event.table {
            Table::Teams => self.fold_team(&event).await,
            Table::TeamMembers => self.fold_member(&event).await,
            other => {
                debug!("[TeamStore] ignoring change on {}", other);
                return;
            }
        };
        match result {
            Ok(FoldOutcome::Missing) => warn!(
                "[TeamStore] update for unknown {} row {:?}, refresh() to resync",
                event.table,
                event.row_id()
            ),
            Ok(outcome) if outcome.changed() => self.core.changed().await,
            Ok(_) => {}
            Err(e) => warn!("[TeamStore] dropping {} change: {:#}", event.table, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::backend::SqliteBackend;
    use crate::sync::team::models::{IconKind, DEFAULT_TEAM_ID, DEFAULT_TEAM_NAME};
    use crate::sync::testing::{
        eventually, init_test_logger, FlakyBackend, InterleavedBackend, RecordingListener,
    };
    use serde_json::json;
    use std::time::Duration;

    async fn open_store() -> (SqliteBackend, TeamStore, Arc<RecordingListener>) {
        init_test_logger();
        let backend = SqliteBackend::in_memory().await.unwrap();
        let listener = Arc::new(RecordingListener::default());
        let store = TeamStore::open(Arc::new(backend.clone()), DEFAULT_TEAM_ID, listener.clone())
            .await
            .unwrap();
        (backend, store, listener)
    }

    fn row(value: serde_json::Value) -> Row {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn open_creates_the_default_team_once() {
        let (backend, store, _) = open_store().await;

        let team = store.team().await.unwrap();
        assert_eq!(team.id, DEFAULT_TEAM_ID);
        assert_eq!(team.name, DEFAULT_TEAM_NAME);
        assert_eq!(team.icon_type, IconKind::Emoji);
        assert_eq!(*store.scope().borrow(), Some(DEFAULT_TEAM_ID.to_string()));

        // a second session reads the existing row instead of creating another
        let again = TeamStore::open(
            Arc::new(backend.clone()),
            DEFAULT_TEAM_ID,
            Arc::new(RecordingListener::default()),
        )
        .await
        .unwrap();
        assert_eq!(again.team().await.unwrap().created_at, team.created_at);
        let teams = backend
            .select(Table::Teams, &crate::sync::types::Query::new())
            .await
            .unwrap();
        assert_eq!(teams.len(), 1);
        assert!(!again.snapshot().await.is_loading);
    }

    #[tokio::test]
    async fn add_member_is_visible_before_the_echo() {
        let (_backend, store, listener) = open_store().await;

        let alice = store.add_member("Alice").await.unwrap();
        let members = store.members().await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "Alice");
        assert_eq!(members[0].id, alice.id);
        assert!(!alice.id.is_empty());
        assert_eq!(listener.successes(), vec![MEMBER_ADDED.to_string()]);

        // the echo of the insert folds into the same entity
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(store.members().await.len(), 1);
    }

    #[tokio::test]
    async fn members_are_listed_oldest_first() {
        let (_backend, store, _) = open_store().await;
        for name in ["Bob", "Carol", "Dave"] {
            store.add_member(name).await.unwrap();
        }
        let names: Vec<String> = store
            .list_members(DEFAULT_TEAM_ID)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["Bob", "Carol", "Dave"]);
        let local: Vec<String> = store.members().await.into_iter().map(|m| m.name).collect();
        assert_eq!(local, names);
    }

    #[tokio::test]
    async fn update_and_delete_member() {
        let (_backend, store, listener) = open_store().await;
        let bob = store.add_member("Bob").await.unwrap();

        store.update_member(&bob.id, "Robert").await.unwrap();
        assert_eq!(store.members().await[0].name, "Robert");

        store.delete_member(&bob.id).await.unwrap();
        assert!(store.members().await.is_empty());
        assert_eq!(
            listener.successes(),
            vec![MEMBER_ADDED, MEMBER_UPDATED, MEMBER_DELETED]
        );
    }

    #[tokio::test]
    async fn blank_name_is_rejected_without_touching_state() {
        let (_backend, store, listener) = open_store().await;

        let err = store.add_member("   ").await.unwrap_err();
        assert!(err.is_validation());
        assert!(store.members().await.is_empty());
        assert_eq!(listener.failures(), vec![MEMBER_ADD_FAILED.to_string()]);
    }

    #[tokio::test]
    async fn failed_write_leaves_members_unchanged() {
        init_test_logger();
        let backend = Arc::new(FlakyBackend::new().await.unwrap());
        let listener = Arc::new(RecordingListener::default());
        let store = TeamStore::open(backend.clone(), DEFAULT_TEAM_ID, listener.clone())
            .await
            .unwrap();
        let bob = store.add_member("Bob").await.unwrap();

        backend.fail_writes(true);
        assert!(store.add_member("Alice").await.unwrap_err().is_backend());
        assert!(store.update_member(&bob.id, "Robert").await.unwrap_err().is_backend());
        assert!(store.delete_member(&bob.id).await.unwrap_err().is_backend());

        let members = store.members().await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "Bob");
        assert_eq!(
            listener.failures(),
            vec![MEMBER_ADD_FAILED, MEMBER_UPDATE_FAILED, MEMBER_DELETE_FAILED]
        );
        assert!(store.snapshot().await.error.is_some());
    }

    #[tokio::test]
    async fn failed_team_create_is_surfaced_and_refresh_recovers() {
        init_test_logger();
        let backend = Arc::new(FlakyBackend::new().await.unwrap());
        backend.fail_writes(true);
        let listener = Arc::new(RecordingListener::default());
        let store = TeamStore::open(backend.clone(), DEFAULT_TEAM_ID, listener.clone())
            .await
            .unwrap();

        let snapshot = store.snapshot().await;
        assert!(snapshot.team.is_none());
        assert!(!snapshot.is_loading);
        assert!(snapshot.error.is_some());
        assert_eq!(listener.failures(), vec![TEAM_LOAD_FAILED.to_string()]);
        assert!(store.add_member("Bob").await.unwrap_err().is_context_misuse());

        backend.fail_writes(false);
        store.refresh().await.unwrap();
        assert!(store.team().await.is_some());
        assert!(store.snapshot().await.error.is_none());
    }

    #[tokio::test]
    async fn loading_flag_clears_after_every_load() {
        let (_backend, store, _) = open_store().await;
        assert!(!store.snapshot().await.is_loading);

        store.refresh().await.unwrap();
        assert!(!store.snapshot().await.is_loading);

        store.get_or_create_team().await.unwrap();
        assert!(!store.snapshot().await.is_loading);
        assert!(format!("{:?}", store).contains(DEFAULT_TEAM_ID));
    }

    #[tokio::test]
    async fn loading_flag_clears_after_a_failed_refresh() {
        init_test_logger();
        let backend = Arc::new(FlakyBackend::new().await.unwrap());
        backend.fail_writes(true);
        let store = TeamStore::open(backend.clone(), DEFAULT_TEAM_ID, Arc::new(RecordingListener::default()))
            .await
            .unwrap();

        assert!(store.refresh().await.unwrap_err().is_backend());
        assert!(!store.snapshot().await.is_loading);
        assert!(store.get_or_create_team().await.unwrap_err().is_backend());
        assert!(!store.snapshot().await.is_loading);
    }

    #[tokio::test]
    async fn member_written_during_initial_fetch_is_kept() {
        init_test_logger();
        let backend = Arc::new(InterleavedBackend::new().await.unwrap());
        backend.insert_during_select(
            Table::TeamMembers,
            row(json!({"team_id": DEFAULT_TEAM_ID, "name": "Eve"})),
        );
        let store = TeamStore::open(backend.clone(), DEFAULT_TEAM_ID, Arc::new(RecordingListener::default()))
            .await
            .unwrap();

        let s = &store;
        assert!(eventually(|| async move { s.members().await.len() == 1 }).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.members().await[0].name, "Eve");
    }

    #[tokio::test]
    async fn remote_member_changes_are_folded() {
        let (backend, store, _) = open_store().await;

        let other_session = backend
            .insert(
                Table::TeamMembers,
                row(json!({"team_id": DEFAULT_TEAM_ID, "name": "Eve"})),
            )
            .await
            .unwrap();
        let id = other_session["id"].as_str().unwrap().to_string();
        let s = &store;
        assert!(eventually(|| async move { s.members().await.len() == 1 }).await);

        backend
            .update(Table::TeamMembers, &id, row(json!({"name": "Eve B."})))
            .await
            .unwrap();
        assert!(eventually(|| async move { s.members().await[0].name == "Eve B." }).await);

        backend.delete(Table::TeamMembers, &id).await.unwrap();
        assert!(eventually(|| async move { s.members().await.is_empty() }).await);
    }

    #[tokio::test]
    async fn update_team_patches_the_snapshot() {
        let (_backend, store, listener) = open_store().await;

        let team = store
            .update_team(TeamPatch {
                name: Some("Platform".into()),
                icon_type: Some(IconKind::Image),
                icon_value: Some(Some("https://img.example/p.png".into())),
            })
            .await
            .unwrap();
        assert_eq!(team.name, "Platform");
        assert_eq!(store.team().await.unwrap().icon_type, IconKind::Image);
        assert!(listener.successes().contains(&TEAM_UPDATED.to_string()));

        let err = store.update_team(TeamPatch::default()).await.unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn remote_team_delete_withdraws_the_scope() {
        let (backend, store, _) = open_store().await;
        let mut scope = store.scope();
        assert!(scope.borrow_and_update().is_some());

        backend.delete(Table::Teams, DEFAULT_TEAM_ID).await.unwrap();
        let s = &store;
        assert!(eventually(|| async move { s.team().await.is_none() }).await);
        assert!(scope.borrow().is_none());
    }

    #[tokio::test]
    async fn commands_after_shutdown_are_context_errors() {
        let (_backend, store, _) = open_store().await;
        store.shutdown().await;

        assert!(store.add_member("Bob").await.unwrap_err().is_context_misuse());
        assert!(store.refresh().await.unwrap_err().is_context_misuse());
    }
}
