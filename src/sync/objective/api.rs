//! Typed table access for objectives

use crate::sync::backend::Backend;
use crate::sync::objective::models::{NewObjective, Objective, ObjectivePatch};
use crate::sync::types::{from_row, to_row, Query, SortOrder, Table};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::debug;

pub struct ObjectiveApi {
    backend: Arc<dyn Backend>,
}

impl ObjectiveApi {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Objectives of a team, oldest first
    pub async fn list_objectives(&self, team_id: &str) -> Result<Vec<Objective>> {
        let query = Query::new()
            .eq("team_id", team_id)
            .order(SortOrder::Ascending);
        let rows = self
            .backend
            .select(Table::Okrs, &query)
            .await
            .context("failed to fetch OKRs")?;
        debug!("[ObjectiveAPI] team {} -> {} OKRs", team_id, rows.len());
        rows.into_iter().map(from_row).collect()
    }

    pub async fn insert_objective(&self, objective: &NewObjective) -> Result<Objective> {
        let row = self
            .backend
            .insert(Table::Okrs, to_row(objective)?)
            .await
            .context("failed to add OKR")?;
        from_row(row)
    }

    pub async fn update_objective(&self, id: &str, patch: &ObjectivePatch) -> Result<()> {
        self.backend
            .update(Table::Okrs, id, to_row(patch)?)
            .await
            .context("failed to update OKR")
    }

    pub async fn delete_objective(&self, id: &str) -> Result<()> {
        self.backend
            .delete(Table::Okrs, id)
            .await
            .context("failed to delete OKR")
    }
}
