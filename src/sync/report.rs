//! Report projection
//!
//! Stateless aggregates over the objective and goal snapshots, recomputed on
//! every read.

use crate::sync::goal::{Goal, GoalStatus};
use crate::sync::objective::Objective;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

/// Distinct members with at least one goal on an objective
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OkrMemberCount {
    pub okr_id: String,
    pub title: String,
    pub count: usize,
}

/// Goal status counts of one objective
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OkrStatusCounts {
    pub okr_id: String,
    pub title: String,
    pub not_started: usize,
    pub in_progress: usize,
    pub completed: usize,
}

impl OkrStatusCounts {
    pub fn total(&self) -> usize {
        self.not_started + self.in_progress + self.completed
    }
}

/// One slice of the overall status breakdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSlice {
    pub status: GoalStatus,
    pub label: &'static str,
    pub value: usize,
    pub color: &'static str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Report {
    pub members_by_okr: Vec<OkrMemberCount>,
    pub goals_by_okr: Vec<OkrStatusCounts>,
    /// Statuses that occur at least once, in status order
    pub status_breakdown: Vec<StatusSlice>,
}

/// Builds every report series; objectives keep the order they are given in
pub fn build_report(objectives: &[Objective], goals: &[Goal]) -> Report {
    let mut members_by_okr = Vec::with_capacity(objectives.len());
    let mut goals_by_okr = Vec::with_capacity(objectives.len());

    for okr in objectives {
        let okr_goals: Vec<&Goal> = goals.iter().filter(|g| g.okr_id == okr.id).collect();

        let members: HashSet<&str> = okr_goals
            .iter()
            .map(|g| g.team_member_id.as_str())
            .collect();
        members_by_okr.push(OkrMemberCount {
            okr_id: okr.id.clone(),
            title: okr.title.clone(),
            count: members.len(),
        });

        let mut counts = OkrStatusCounts {
            okr_id: okr.id.clone(),
            title: okr.title.clone(),
            ..Default::default()
        };
        for goal in &okr_goals {
            match goal.status {
                GoalStatus::NotStarted => counts.not_started += 1,
                GoalStatus::InProgress => counts.in_progress += 1,
                GoalStatus::Completed => counts.completed += 1,
            }
        }
        goals_by_okr.push(counts);
    }

    let status_breakdown = GoalStatus::ALL
        .iter()
        .filter_map(|status| {
            let value = goals.iter().filter(|g| g.status == *status).count();
            (value > 0).then(|| StatusSlice {
                status: *status,
                label: status.label(),
                value,
                color: status.color(),
            })
        })
        .collect();

    Report {
        members_by_okr,
        goals_by_okr,
        status_breakdown,
    }
}

/// Colour band of an objective's progress bar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressColor {
    Red,
    Amber,
    Green,
}

impl fmt::Display for ProgressColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProgressColor::Red => "red",
            ProgressColor::Amber => "amber",
            ProgressColor::Green => "green",
        })
    }
}

/// 0 is red, up to 0.7 amber, above that green
pub fn progress_color(progress: f64) -> ProgressColor {
    if progress == 0.0 {
        ProgressColor::Red
    } else if progress <= 0.7 {
        ProgressColor::Amber
    } else {
        ProgressColor::Green
    }
}

/// `in_progress` -> `In Progress`
pub fn format_status(status: &str) -> String {
    status
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
