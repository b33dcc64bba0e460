//! Typed table access for goals and their comments

use crate::sync::backend::Backend;
use crate::sync::goal::models::{Comment, Goal, GoalPatch, NewComment, NewGoal};
use crate::sync::types::{from_row, to_row, Query, SortOrder, Table};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub struct GoalApi {
    backend: Arc<dyn Backend>,
}

impl GoalApi {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Goals of a team in `order`, each with its comments (oldest first)
    pub async fn list_goals(&self, team_id: &str, order: SortOrder) -> Result<Vec<Goal>> {
        let query = Query::new().eq("team_id", team_id).order(order);
        let rows = self
            .backend
            .select(Table::WeeklyGoals, &query)
            .await
            .context("failed to fetch goals")?;
        let mut goals: Vec<Goal> = rows
            .into_iter()
            .map(from_row)
            .collect::<Result<_>>()?;

        let ids: Vec<String> = goals.iter().map(|g| g.id.clone()).collect();
        let comment_query = Query::new()
            .is_in("goal_id", ids)
            .order(SortOrder::Ascending);
        let comment_rows = self
            .backend
            .select(Table::GoalComments, &comment_query)
            .await
            .context("failed to fetch goal comments")?;

        let mut by_goal: HashMap<String, Vec<Comment>> = HashMap::new();
        for row in comment_rows {
            let comment: Comment = from_row(row)?;
            by_goal.entry(comment.goal_id.clone()).or_default().push(comment);
        }
        for goal in &mut goals {
            goal.comments = by_goal.remove(&goal.id).unwrap_or_default();
        }
        debug!("[GoalAPI] team {} -> {} goals", team_id, goals.len());
        Ok(goals)
    }

    pub async fn insert_goal(&self, goal: &NewGoal) -> Result<Goal> {
        let row = self
            .backend
            .insert(Table::WeeklyGoals, to_row(goal)?)
            .await
            .context("failed to add goal")?;
        from_row(row)
    }

    pub async fn update_goal(&self, id: &str, patch: &GoalPatch) -> Result<()> {
        self.backend
            .update(Table::WeeklyGoals, id, to_row(patch)?)
            .await
            .context("failed to update goal")
    }

    pub async fn delete_goal(&self, id: &str) -> Result<()> {
        self.backend
            .delete(Table::WeeklyGoals, id)
            .await
            .context("failed to delete goal")
    }

    /// Comments of one goal, oldest first
    pub async fn list_comments(&self, goal_id: &str) -> Result<Vec<Comment>> {
        let query = Query::new()
            .eq("goal_id", goal_id)
            .order(SortOrder::Ascending);
        let rows = self
            .backend
            .select(Table::GoalComments, &query)
            .await
            .context("failed to fetch comments")?;
        rows.into_iter().map(from_row).collect()
    }

    pub async fn insert_comment(&self, comment: &NewComment) -> Result<Comment> {
        let row = self
            .backend
            .insert(Table::GoalComments, to_row(comment)?)
            .await
            .context("failed to add comment")?;
        from_row(row)
    }

    pub async fn delete_comment(&self, id: &str) -> Result<()> {
        self.backend
            .delete(Table::GoalComments, id)
            .await
            .context("failed to delete comment")
    }
}
