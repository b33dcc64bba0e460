//! Create / edit form state for members, objectives and goals
//!
//! A form is either closed, creating a new entity from a draft, or editing
//! an existing entity by id. Submitting validates the draft and tells the
//! caller which store command to issue; the `save_*` helpers issue it and
//! close the form only when the command succeeded.

use crate::sync::error::{require_text, SyncError, SyncResult};
use crate::sync::goal::{Goal, GoalInput, GoalPatch, GoalStore};
use crate::sync::objective::{Objective, ObjectivePatch, ObjectiveStore};
use crate::sync::team::{Member, TeamStore};

/// Editable form content
pub trait Draft: Clone + Default {
    /// Validated, normalized content
    type Output;

    fn validate(&self) -> SyncResult<Self::Output>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum FormState<D> {
    #[default]
    Idle,
    Creating(D),
    Editing { id: String, draft: D },
}

/// What a valid form submits
#[derive(Debug, Clone, PartialEq)]
pub enum Submission<T> {
    Create(T),
    Update(String, T),
}

impl<D: Draft> FormState<D> {
    pub fn create() -> Self {
        FormState::Creating(D::default())
    }

    pub fn edit(id: impl Into<String>, draft: D) -> Self {
        FormState::Editing {
            id: id.into(),
            draft,
        }
    }

    pub fn is_open(&self) -> bool {
        !matches!(self, FormState::Idle)
    }

    pub fn draft(&self) -> Option<&D> {
        match self {
            FormState::Idle => None,
            FormState::Creating(draft) | FormState::Editing { draft, .. } => Some(draft),
        }
    }

    pub fn draft_mut(&mut self) -> Option<&mut D> {
        match self {
            FormState::Idle => None,
            FormState::Creating(draft) | FormState::Editing { draft, .. } => Some(draft),
        }
    }

    /// Closes the form, discarding the draft
    pub fn reset(&mut self) {
        *self = FormState::Idle;
    }

    pub fn submit(&self) -> SyncResult<Submission<D::Output>> {
        match self {
            FormState::Idle => Err(SyncError::ContextMisuse("no form is open".to_string())),
            FormState::Creating(draft) => Ok(Submission::Create(draft.validate()?)),
            FormState::Editing { id, draft } => Ok(Submission::Update(id.clone(), draft.validate()?)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberDraft {
    pub name: String,
}

impl Draft for MemberDraft {
    type Output = String;

    fn validate(&self) -> SyncResult<String> {
        require_text("member name", &self.name)?;
        Ok(self.name.trim().to_string())
    }
}

impl From<&Member> for MemberDraft {
    fn from(member: &Member) -> Self {
        Self {
            name: member.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectiveDraft {
    pub title: String,
    pub description: String,
}

impl Draft for ObjectiveDraft {
    /// Title and optional description
    type Output = (String, Option<String>);

    fn validate(&self) -> SyncResult<Self::Output> {
        require_text("objective title", &self.title)?;
        let description = Some(self.description.trim())
            .filter(|d| !d.is_empty())
            .map(str::to_string);
        Ok((self.title.trim().to_string(), description))
    }
}

impl From<&Objective> for ObjectiveDraft {
    fn from(objective: &Objective) -> Self {
        Self {
            title: objective.title.clone(),
            description: objective.description.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GoalDraft {
    pub description: String,
    pub team_member_id: String,
    pub okr_id: String,
}

impl Draft for GoalDraft {
    type Output = GoalInput;

    fn validate(&self) -> SyncResult<GoalInput> {
        let input = GoalInput {
            description: self.description.trim().to_string(),
            team_member_id: self.team_member_id.clone(),
            okr_id: self.okr_id.clone(),
        };
        input.validate()?;
        Ok(input)
    }
}

impl From<&Goal> for GoalDraft {
    fn from(goal: &Goal) -> Self {
        Self {
            description: goal.description.clone(),
            team_member_id: goal.team_member_id.clone(),
            okr_id: goal.okr_id.clone(),
        }
    }
}

pub async fn save_member(form: &mut FormState<MemberDraft>, store: &TeamStore) -> SyncResult<()> {
    match form.submit()? {
        Submission::Create(name) => {
            store.add_member(&name).await?;
        }
        Submission::Update(id, name) => store.update_member(&id, &name).await?,
    }
    form.reset();
    Ok(())
}

pub async fn save_objective(
    form: &mut FormState<ObjectiveDraft>,
    store: &ObjectiveStore,
) -> SyncResult<()> {
    match form.submit()? {
        Submission::Create((title, description)) => {
            store.add_objective(&title, description.as_deref()).await?;
        }
        Submission::Update(id, (title, description)) => {
            let patch = ObjectivePatch {
                title: Some(title),
                description: Some(description),
                progress: None,
            };
            store.update_objective(&id, patch).await?;
        }
    }
    form.reset();
    Ok(())
}

pub async fn save_goal(form: &mut FormState<GoalDraft>, store: &GoalStore) -> SyncResult<()> {
    match form.submit()? {
        Submission::Create(input) => {
            store.add_goal(input).await?;
        }
        Submission::Update(id, input) => store.update_goal(&id, GoalPatch::from(input)).await?,
    }
    form.reset();
    Ok(())
}
