//! GoalStore: weekly goals of the active team with their comments
//!
//! Two tables feed the snapshot. Goal changes fold like every other store;
//! comment changes attach to or detach from the goal that owns them.

use crate::sync::backend::Backend;
use crate::sync::error::{require_text, SyncError, SyncResult};
use crate::sync::goal::api::GoalApi;
use crate::sync::goal::models::{
    Comment, Goal, GoalInput, GoalPatch, GoalSnapshot, GoalStatus, NewComment, NewGoal,
};
use crate::sync::listener::SyncListener;
use crate::sync::reconcile::{ChangeEvent, ChangeKind, FoldOutcome, ReplayBuffer, Snapshot};
use crate::sync::store::{spawn_scope_watch, subscribe_tables, ChangeSink, ScopedStore, StoreCore};
use crate::sync::types::{from_row, to_row, SortOrder, StoreKind, Table};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

const GOALS_LOAD_FAILED: &str = "Failed to fetch goals";
const GOALS_SUBSCRIBE_FAILED: &str = "Failed to subscribe to goal changes";
const GOAL_ADDED: &str = "Goal added successfully";
const GOAL_ADD_FAILED: &str = "Failed to add goal";
const GOAL_UPDATED: &str = "Goal updated successfully";
const GOAL_UPDATE_FAILED: &str = "Failed to update goal";
const STATUS_UPDATED: &str = "Status updated successfully";
const STATUS_UPDATE_FAILED: &str = "Failed to update status";
const GOAL_DELETED: &str = "Goal deleted successfully";
const GOAL_DELETE_FAILED: &str = "Failed to delete goal";
const COMMENT_ADDED: &str = "Comment added successfully";
const COMMENT_ADD_FAILED: &str = "Failed to add comment";
const COMMENT_DELETED: &str = "Comment deleted successfully";
const COMMENT_DELETE_FAILED: &str = "Failed to delete comment";
const COMMENTS_LOAD_FAILED: &str = "Failed to fetch comments";

struct GoalState {
    team_id: Option<String>,
    goals: Snapshot<Goal>,
    /// Notifications that arrive while a fetch is in flight
    replay: ReplayBuffer,
    is_loading: bool,
}

impl GoalState {
    /// Folds a goal or comment change; `None` for tables this store ignores
    fn fold(&mut self, event: &ChangeEvent, team_id: &str) -> Option<anyhow::Result<FoldOutcome>> {
        match event.table {
            Table::WeeklyGoals => Some(self.goals.apply(event, Some(team_id))),
            Table::GoalComments => Some(self.fold_comment(event)),
            _ => None,
        }
    }

    /// Folds a comment change into the goal that owns it
    fn fold_comment(&mut self, event: &ChangeEvent) -> anyhow::Result<FoldOutcome> {
        match event.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let comment: Comment = from_row(event.new.clone())?;
                let Some(goal) = self.goals.get_mut(&comment.goal_id) else {
                    return Ok(FoldOutcome::Ignored);
                };
                Ok(if goal.attach_comment(comment) {
                    FoldOutcome::Merged
                } else {
                    FoldOutcome::Unchanged
                })
            }
            ChangeKind::Delete => {
                let Some(comment_id) = event.row_id() else {
                    anyhow::bail!("comment delete without id");
                };
                // the old row may carry only the id, so search every goal
                let removed = self
                    .goals
                    .values_mut()
                    .fold(false, |removed, goal| goal.detach_comment(comment_id) || removed);
                Ok(if removed {
                    FoldOutcome::Removed
                } else {
                    FoldOutcome::Ignored
                })
            }
        }
    }
}

struct GoalStoreInner {
    core: StoreCore,
    api: GoalApi,
    backend: Arc<dyn Backend>,
    order: SortOrder,
    state: RwLock<GoalState>,
}

#[derive(Clone)]
pub struct GoalStore {
    inner: Arc<GoalStoreInner>,
}

impl fmt::Debug for GoalStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GoalStore")
            .field("order", &self.inner.order)
            .field("closed", &self.inner.core.is_closed())
            .finish_non_exhaustive()
    }
}

impl GoalStore {
    /// Loads the goals of the current scope, listed in `order`
    pub async fn open(
        backend: Arc<dyn Backend>,
        mut scope: watch::Receiver<Option<String>>,
        order: SortOrder,
        listener: Arc<dyn SyncListener>,
    ) -> SyncResult<Self> {
        let team_id = scope.borrow_and_update().clone();
        info!("[GoalStore] opening store, team {:?}, order {:?}", team_id, order);

        let inner = Arc::new(GoalStoreInner {
            core: StoreCore::new(StoreKind::Goals, "GoalStore", listener),
            api: GoalApi::new(backend.clone()),
            backend,
            order,
            state: RwLock::new(GoalState {
                team_id: None,
                goals: Snapshot::new(order),
                replay: ReplayBuffer::default(),
                is_loading: false,
            }),
        });

        // a failed initial load stays on the snapshot; refresh() retries it
        let _ = GoalStoreInner::load_scope(&inner, team_id).await;
        let watcher = spawn_scope_watch(Arc::downgrade(&inner), scope);
        inner.core.set_watcher(watcher).await;
        Ok(Self { inner })
    }

    /// Refetches goals (with comments) of the active team
    pub async fn list_goals(&self) -> SyncResult<Vec<Goal>> {
        self.inner.core.ensure_open()?;
        let team_id = self.inner.active_team_id().await?;
        self.inner.fetch(&team_id).await
    }

    /// Creates a goal in `not_started`
    pub async fn add_goal(&self, input: GoalInput) -> SyncResult<Goal> {
        let inner = &self.inner;
        inner.core.ensure_open()?;
        if let Err(e) = input.validate() {
            return inner.core.fail(GOAL_ADD_FAILED, e).await;
        }
        let team_id = inner.active_team_id().await?;

        let new_goal = NewGoal {
            team_id: team_id.clone(),
            okr_id: input.okr_id,
            team_member_id: input.team_member_id,
            description: input.description.trim().to_string(),
            status: GoalStatus::NotStarted,
        };
        match inner.api.insert_goal(&new_goal).await {
            Ok(goal) => {
                let local = goal.clone();
                inner.in_scope(&team_id, move |goals| goals.upsert(local)).await;
                inner.core.succeed(GOAL_ADDED).await;
                Ok(goal)
            }
            Err(e) => inner.core.fail(GOAL_ADD_FAILED, SyncError::backend(e)).await,
        }
    }

    pub async fn update_goal(&self, id: &str, patch: GoalPatch) -> SyncResult<()> {
        self.patch_goal(id, patch, GOAL_UPDATED, GOAL_UPDATE_FAILED)
            .await
    }

    pub async fn update_status(&self, id: &str, status: GoalStatus) -> SyncResult<()> {
        self.patch_goal(id, GoalPatch::status(status), STATUS_UPDATED, STATUS_UPDATE_FAILED)
            .await
    }

    async fn patch_goal(
        &self,
        id: &str,
        patch: GoalPatch,
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

        if let Err(e) = inner.api.update_goal(id, &patch).await {
            return inner.core.fail(fail_message, SyncError::backend(e)).await;
        }
        let patched = inner
            .in_scope(&team_id, |goals| goals.patch(id, &fields))
            .await;
        if let Some(Err(e)) = patched {
            warn!("[GoalStore] local patch of goal {} failed: {:#}", id, e);
        }
        inner.core.succeed(ok_message).await;
        Ok(())
    }

    pub async fn delete_goal(&self, id: &str) -> SyncResult<()> {
        let inner = &self.inner;
        inner.core.ensure_open()?;
        let team_id = inner.active_team_id().await?;

        match inner.api.delete_goal(id).await {
            Ok(()) => {
                inner.in_scope(&team_id, |goals| goals.remove(id)).await;
                inner.core.succeed(GOAL_DELETED).await;
                Ok(())
            }
            Err(e) => inner.core.fail(GOAL_DELETE_FAILED, SyncError::backend(e)).await,
        }
    }

    /// Adds a comment and appends it to the goal's comment list
    pub async fn add_comment(&self, goal_id: &str, text: &str) -> SyncResult<Comment> {
        let inner = &self.inner;
        inner.core.ensure_open()?;
        if let Err(e) = require_text("comment", text) {
            return inner.core.fail(COMMENT_ADD_FAILED, e).await;
        }
        let team_id = inner.active_team_id().await?;

        let new_comment = NewComment {
            goal_id: goal_id.to_string(),
            text: text.trim().to_string(),
        };
        match inner.api.insert_comment(&new_comment).await {
            Ok(comment) => {
                let local = comment.clone();
                inner
                    .in_scope(&team_id, move |goals| {
                        goals.get_mut(goal_id).map(|goal| goal.attach_comment(local))
                    })
                    .await;
                inner.core.succeed(COMMENT_ADDED).await;
                Ok(comment)
            }
            Err(e) => inner.core.fail(COMMENT_ADD_FAILED, SyncError::backend(e)).await,
        }
    }

    pub async fn delete_comment(&self, comment_id: &str) -> SyncResult<()> {
        let inner = &self.inner;
        inner.core.ensure_open()?;
        let team_id = inner.active_team_id().await?;

        match inner.api.delete_comment(comment_id).await {
            Ok(()) => {
                inner
                    .in_scope(&team_id, |goals| {
                        for goal in goals.values_mut() {
                            goal.detach_comment(comment_id);
                        }
                    })
                    .await;
                inner.core.succeed(COMMENT_DELETED).await;
                Ok(())
            }
            Err(e) => inner.core.fail(COMMENT_DELETE_FAILED, SyncError::backend(e)).await,
        }
    }

    /// Refetches the comments of one goal, oldest first
    pub async fn get_comments(&self, goal_id: &str) -> SyncResult<Vec<Comment>> {
        let inner = &self.inner;
        inner.core.ensure_open()?;
        let team_id = inner.active_team_id().await?;

        inner.state.write().await.replay.begin();
        let fetched = inner.api.list_comments(goal_id).await;

        let mut state = inner.state.write().await;
        let replay = state.replay.finish();
        match fetched {
            Ok(comments) => {
                if state.team_id.as_deref() == Some(team_id.as_str()) {
                    if let Some(goal) = state.goals.get_mut(goal_id) {
                        goal.comments = comments.clone();
                    }
                    for event in replay.iter().filter(|e| e.table == Table::GoalComments) {
                        if let Err(e) = state.fold_comment(event) {
                            warn!("[GoalStore] dropping replayed comment change: {:#}", e);
                        }
                    }
                }
                Ok(comments)
            }
            Err(e) => {
                drop(state);
                inner.core.fail(COMMENTS_LOAD_FAILED, SyncError::backend(e)).await
            }
        }
    }

    pub async fn refresh(&self) -> SyncResult<()> {
        self.list_goals().await.map(|_| ())
    }

    /// Local snapshot in the store's order
    pub async fn goals(&self) -> Vec<Goal> {
        self.inner.state.read().await.goals.list()
    }

    pub async fn get(&self, id: &str) -> Option<Goal> {
        self.inner.state.read().await.goals.get(id).cloned()
    }

    pub fn order(&self) -> SortOrder {
        self.inner.order
    }

    pub async fn snapshot(&self) -> GoalSnapshot {
        let error = self.inner.core.last_error().await;
        let state = self.inner.state.read().await;
        GoalSnapshot {
            goals: state.goals.list(),
            is_loading: state.is_loading,
            error,
        }
    }

    pub async fn shutdown(&self) {
        self.inner.core.close().await;
    }
}

impl GoalStoreInner {
    async fn active_team_id(&self) -> SyncResult<String> {
        self.state
            .read()
            .await
            .team_id
            .clone()
            .ok_or_else(|| SyncError::ContextMisuse("No team selected".to_string()))
    }

    async fn in_scope<R>(&self, team_id: &str, f: impl FnOnce(&mut Snapshot<Goal>) -> R) -> Option<R> {
        let mut state = self.state.write().await;
        if state.team_id.as_deref() != Some(team_id) {
            debug!("[GoalStore] scope changed during write, skipping local update");
            return None;
        }
        Some(f(&mut state.goals))
    }

    async fn fetch(&self, team_id: &str) -> SyncResult<Vec<Goal>> {
        self.state.write().await.replay.begin();
        let fetched = self.api.list_goals(team_id, self.order).await;

        let mut state = self.state.write().await;
        let replay = state.replay.finish();
        state.is_loading = false;
        match fetched {
            Ok(goals) => {
                let listed = if state.team_id.as_deref() == Some(team_id) {
                    state.goals.replace_all(goals);
                    for event in &replay {
                        if let Some(Err(e)) = state.fold(event, team_id) {
                            warn!("[GoalStore] dropping replayed {} change: {:#}", event.table, e);
                        }
                    }
                    state.goals.list()
                } else {
                    goals
                };
                drop(state);
                self.core.clear_error().await;
                self.core.changed().await;
                Ok(listed)
            }
            Err(e) => {
                drop(state);
                self.core.fail(GOALS_LOAD_FAILED, SyncError::backend(e)).await
            }
        }
    }

    async fn load_scope(this: &Arc<Self>, team_id: Option<String>) -> SyncResult<()> {
        this.core.stop_tasks().await;
        {
            let mut state = this.state.write().await;
            state.team_id = team_id.clone();
            state.goals.clear();
            state.is_loading = team_id.is_some();
        }
        let Some(team_id) = team_id else {
            this.core.changed().await;
            return Ok(());
        };

        let tables = [Table::WeeklyGoals, Table::GoalComments];
        if let Err(e) = subscribe_tables(&this.core, this.backend.as_ref(), this, &tables).await {
            this.state.write().await.is_loading = false;
            return this.core.fail(GOALS_SUBSCRIBE_FAILED, SyncError::backend(e)).await;
        }
        this.fetch(&team_id).await.map(|_| ())
    }
}

#[async_trait]
impl ChangeSink for GoalStoreInner {
    fn core(&self) -> &StoreCore {
        &self.core
    }

    async fn apply_change(&self, event: ChangeEvent) {
        if self.core.is_closed() {
            return;
        }
        let result = {
            let mut state = self.state.write().await;
            let Some(team_id) = state.team_id.clone() else { return };
            let Some(result) = state.fold(&event, &team_id) else {
                debug!("[GoalStore] ignoring change on {}", event.table);
                return;
            };
            state.replay.record(&event);
            result
        };
        match result {
            Ok(FoldOutcome::Missing) => warn!(
                "[GoalStore] update for unknown goal {:?}, refresh() to resync",
                event.row_id()
            ),
            Ok(outcome) if outcome.changed() => self.core.changed().await,
            Ok(_) => {}
            Err(e) => warn!("[GoalStore] dropping {} change: {:#}", event.table, e),
        }
    }
}

#[async_trait]
impl ScopedStore for GoalStoreInner {
    async fn rescope(self: Arc<Self>, team_id: Option<String>) {
        let _ = Self::load_scope(&self, team_id).await;
    }
}
