//! Shared table / query types used by every backend and store.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// A single table row as it travels between backend and stores
pub type Row = serde_json::Map<String, Value>;

/// Remote tables mirrored by the stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Teams,
    TeamMembers,
    Okrs,
    WeeklyGoals,
    GoalComments,
}

impl Table {
    pub const ALL: [Table; 5] = [
        Table::Teams,
        Table::TeamMembers,
        Table::Okrs,
        Table::WeeklyGoals,
        Table::GoalComments,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Teams => "teams",
            Table::TeamMembers => "team_members",
            Table::Okrs => "okrs",
            Table::WeeklyGoals => "weekly_goals",
            Table::GoalComments => "goal_comments",
        }
    }

    /// Column set of the table, in declaration order
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Table::Teams => &["id", "name", "icon_type", "icon_value", "created_at"],
            Table::TeamMembers => &["id", "team_id", "name", "created_at"],
            Table::Okrs => &[
                "id",
                "team_id",
                "title",
                "description",
                "progress",
                "created_at",
            ],
            Table::WeeklyGoals => &[
                "id",
                "team_id",
                "okr_id",
                "team_member_id",
                "description",
                "status",
                "created_at",
            ],
            Table::GoalComments => &["id", "goal_id", "comment", "created_at"],
        }
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns().contains(&column)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match Table::ALL.iter().find(|t| t.as_str() == s) {
            Some(table) => Ok(*table),
            None => bail!("unknown table: {}", s),
        }
    }
}

/// Ordering by creation time (ties broken by id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn keyword(&self) -> &'static str {
        match self {
            SortOrder::Ascending => "asc",
            SortOrder::Descending => "desc",
        }
    }
}

/// Row filter understood by every backend
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    In(String, Vec<Value>),
}

impl Filter {
    pub fn column(&self) -> &str {
        match self {
            Filter::Eq(column, _) | Filter::In(column, _) => column,
        }
    }
}

/// Table read: conjunction of filters plus creation-time ordering
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order: Option<SortOrder>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(column.to_string(), value.into()));
        self
    }

    pub fn is_in<V: Into<Value>>(mut self, column: &str, values: impl IntoIterator<Item = V>) -> Self {
        self.filters.push(Filter::In(
            column.to_string(),
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = Some(order);
        self
    }

    /// True when an `In` filter has no candidates, so no row can match
    pub fn is_empty_match(&self) -> bool {
        self.filters
            .iter()
            .any(|f| matches!(f, Filter::In(_, values) if values.is_empty()))
    }

    /// Rejects filters on columns the table does not have
    pub fn check_columns(&self, table: Table) -> Result<()> {
        for filter in &self.filters {
            if !table.has_column(filter.column()) {
                bail!("column {} does not exist on {}", filter.column(), table);
            }
        }
        Ok(())
    }
}

/// Which store a change notification refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Team,
    Objectives,
    Goals,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StoreKind::Team => "team",
            StoreKind::Objectives => "objectives",
            StoreKind::Goals => "goals",
        })
    }
}

/// Serializes a typed value into a row, dropping nothing
pub(crate) fn to_row<T: Serialize>(value: &T) -> Result<Row> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => bail!("expected a JSON object, got {}", other),
    }
}

/// Decodes a row into a typed value
pub(crate) fn from_row<T: serde::de::DeserializeOwned>(row: Row) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(row))?)
}
