//! Typed table access for teams and members

use crate::sync::backend::Backend;
use crate::sync::team::models::{Member, NewMember, NewTeam, Team, TeamPatch};
use crate::sync::types::{from_row, to_row, Query, Row, SortOrder, Table};
use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

pub struct TeamApi {
    backend: Arc<dyn Backend>,
}

impl TeamApi {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub async fn fetch_team(&self, team_id: &str) -> Result<Option<Team>> {
        let rows = self
            .backend
            .select(Table::Teams, &Query::new().eq("id", team_id))
            .await
            .context("failed to fetch team")?;
        debug!("[TeamAPI] fetch team {} -> {} rows", team_id, rows.len());
        rows.into_iter().next().map(from_row).transpose()
    }

    pub async fn create_team(&self, team: &NewTeam) -> Result<Team> {
        let row = self
            .backend
            .insert(Table::Teams, to_row(team)?)
            .await
            .context("failed to create team")?;
        from_row(row)
    }

    pub async fn update_team(&self, team_id: &str, patch: &TeamPatch) -> Result<()> {
        self.backend
            .update(Table::Teams, team_id, to_row(patch)?)
            .await
            .context("failed to update team")
    }

    /// Members of a team, oldest first
    pub async fn list_members(&self, team_id: &str) -> Result<Vec<Member>> {
        let query = Query::new()
            .eq("team_id", team_id)
            .order(SortOrder::Ascending);
        let rows = self
            .backend
            .select(Table::TeamMembers, &query)
            .await
            .context("failed to fetch team members")?;
        rows.into_iter().map(from_row).collect()
    }

    pub async fn insert_member(&self, member: &NewMember) -> Result<Member> {
        let row = self
            .backend
            .insert(Table::TeamMembers, to_row(member)?)
            .await
            .context("failed to add team member")?;
        from_row(row)
    }

    pub async fn update_member(&self, id: &str, name: &str) -> Result<()> {
        let mut patch = Row::new();
        patch.insert("name".to_string(), Value::String(name.to_string()));
        self.backend
            .update(Table::TeamMembers, id, patch)
            .await
            .context("failed to update team member")
    }

    pub async fn delete_member(&self, id: &str) -> Result<()> {
        self.backend
            .delete(Table::TeamMembers, id)
            .await
            .context("failed to delete team member")
    }
}
