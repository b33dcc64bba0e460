//! Session client: builds the backend and the three stores
//!
//! One client is created per session; `connect()` opens the stores in
//! dependency order (team first, then the team-scoped objective and goal
//! stores) and `shutdown()` ends every subscription.

use crate::sync::backend::{Backend, RestBackend, SqliteBackend};
use crate::sync::error::{SyncError, SyncResult};
use crate::sync::goal::GoalStore;
use crate::sync::listener::{EmptySyncListener, SyncListener};
use crate::sync::objective::ObjectiveStore;
use crate::sync::report::{build_report, Report};
use crate::sync::team::{TeamStore, DEFAULT_TEAM_ID};
use crate::sync::types::SortOrder;
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

pub const ENV_BACKEND_URL: &str = "TEAMGOALS_BACKEND_URL";
pub const ENV_ACCESS_KEY: &str = "TEAMGOALS_ACCESS_KEY";
pub const ENV_DB_URL: &str = "TEAMGOALS_DB_URL";

/// Embedded database used when nothing else is configured
pub const DEFAULT_DB_URL: &str = "sqlite::memory:";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendConfig {
    /// Hosted database: REST rows + realtime socket
    Remote { url: String, access_key: String },
    /// Embedded SQLite database, e.g. `sqlite://teamgoals.db`
    Sqlite { db_url: String },
}

/// Client configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    pub backend: BackendConfig,
    /// Well-known id of the team to fetch or create
    pub team_id: String,
    /// Listing order of goals
    pub goal_order: SortOrder,
}

impl ClientConfig {
    pub fn new(backend: BackendConfig) -> Self {
        Self {
            backend,
            team_id: DEFAULT_TEAM_ID.to_string(),
            goal_order: SortOrder::Ascending,
        }
    }

    pub fn remote(url: &str, access_key: &str) -> Self {
        Self::new(BackendConfig::Remote {
            url: url.to_string(),
            access_key: access_key.to_string(),
        })
    }

    pub fn sqlite(db_url: &str) -> Self {
        Self::new(BackendConfig::Sqlite {
            db_url: db_url.to_string(),
        })
    }

    /// Reads `TEAMGOALS_BACKEND_URL` / `TEAMGOALS_ACCESS_KEY`, falling back
    /// to the embedded database (`TEAMGOALS_DB_URL`) when no endpoint is set
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        match (non_empty(ENV_BACKEND_URL), non_empty(ENV_ACCESS_KEY)) {
            (Some(url), Some(access_key)) => Ok(Self::remote(&url, &access_key)),
            (Some(_), None) => bail!("{} is set but {} is missing", ENV_BACKEND_URL, ENV_ACCESS_KEY),
            (None, _) => {
                let db_url = non_empty(ENV_DB_URL).unwrap_or_else(|| DEFAULT_DB_URL.to_string());
                warn!(
                    "[Config] {} not set, using embedded database {}",
                    ENV_BACKEND_URL, db_url
                );
                Ok(Self::sqlite(&db_url))
            }
        }
    }

    pub fn with_team_id(mut self, team_id: &str) -> Self {
        self.team_id = team_id.to_string();
        self
    }

    pub fn with_goal_order(mut self, order: SortOrder) -> Self {
        self.goal_order = order;
        self
    }
}

struct Stores {
    teams: TeamStore,
    objectives: ObjectiveStore,
    goals: GoalStore,
}

/// One session against the goal-tracking backend
pub struct TeamGoalsClient {
    config: ClientConfig,
    listener: Arc<dyn SyncListener>,
    backend: Option<Arc<dyn Backend>>,
    stores: Option<Stores>,
}

impl TeamGoalsClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            listener: Arc::new(EmptySyncListener),
            backend: None,
            stores: None,
        }
    }

    /// Registers the listener; takes effect on the next `connect()`
    pub fn set_listener(&mut self, listener: Arc<dyn SyncListener>) {
        self.listener = listener;
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Builds the configured backend and opens the stores
    pub async fn connect(&mut self) -> Result<()> {
        let backend: Arc<dyn Backend> = match &self.config.backend {
            BackendConfig::Remote { url, access_key } => {
                info!("[Client] 🔗 using hosted backend {}", url);
                Arc::new(RestBackend::new(url, access_key)?)
            }
            BackendConfig::Sqlite { db_url } => {
                info!("[Client] 🔗 using embedded database {}", db_url);
                Arc::new(
                    SqliteBackend::connect(db_url)
                        .await
                        .with_context(|| format!("failed to open database {}", db_url))?,
                )
            }
        };
        self.connect_with_backend(backend).await
    }

    /// Opens the stores over an existing backend
    pub async fn connect_with_backend(&mut self, backend: Arc<dyn Backend>) -> Result<()> {
        if self.stores.is_some() {
            warn!("[Client] already connected, closing previous session");
            self.shutdown().await;
        }

        let listener = self.listener.clone();
        let teams = TeamStore::open(backend.clone(), &self.config.team_id, listener.clone())
            .await
            .context("failed to open team store")?;
        let objectives = ObjectiveStore::open(backend.clone(), teams.scope(), listener.clone())
            .await
            .context("failed to open objective store")?;
        let goals = GoalStore::open(
            backend.clone(),
            teams.scope(),
            self.config.goal_order,
            listener,
        )
        .await
        .context("failed to open goal store")?;

        info!("[Client] ✅ session ready for team {}", self.config.team_id);
        self.backend = Some(backend);
        self.stores = Some(Stores {
            teams,
            objectives,
            goals,
        });
        Ok(())
    }

    fn stores(&self) -> SyncResult<&Stores> {
        self.stores
            .as_ref()
            .ok_or_else(|| SyncError::ContextMisuse("client is not connected".to_string()))
    }

    pub fn teams(&self) -> SyncResult<&TeamStore> {
        self.stores().map(|s| &s.teams)
    }

    pub fn objectives(&self) -> SyncResult<&ObjectiveStore> {
        self.stores().map(|s| &s.objectives)
    }

    pub fn goals(&self) -> SyncResult<&GoalStore> {
        self.stores().map(|s| &s.goals)
    }

    pub fn backend(&self) -> SyncResult<Arc<dyn Backend>> {
        self.backend
            .clone()
            .ok_or_else(|| SyncError::ContextMisuse("client is not connected".to_string()))
    }

    /// Report over the current objective and goal snapshots
    pub async fn report(&self) -> SyncResult<Report> {
        let stores = self.stores()?;
        let objectives = stores.objectives.objectives().await;
        let goals = stores.goals.goals().await;
        Ok(build_report(&objectives, &goals))
    }

    /// Closes every store; the client can be connected again afterwards
    pub async fn shutdown(&mut self) {
        if let Some(stores) = self.stores.take() {
            stores.goals.shutdown().await;
            stores.objectives.shutdown().await;
            stores.teams.shutdown().await;
            info!("[Client] session closed");
        }
        self.backend = None;
    }
}
