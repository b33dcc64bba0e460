//! TeamGoals CLI
//!
//! Drives one session against the hosted backend or an embedded database:
//! one-shot commands, the end-to-end demo, the report, and a watch mode that
//! logs every change notification.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use teamgoals_sdk_core_rust::sync::client::{BackendConfig, ClientConfig, TeamGoalsClient};
use teamgoals_sdk_core_rust::sync::form::{save_member, FormState, MemberDraft};
use teamgoals_sdk_core_rust::sync::goal::{GoalInput, GoalStatus};
use teamgoals_sdk_core_rust::sync::listener::SyncListener;
use teamgoals_sdk_core_rust::sync::report::{format_status, progress_color};
use teamgoals_sdk_core_rust::sync::types::{SortOrder, StoreKind};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[command(name = "teamgoals-cli")]
#[command(about = "TeamGoals CLI - team members, OKRs and weekly goals", long_about = None)]
struct Args {
    /// Hosted backend url (defaults to $TEAMGOALS_BACKEND_URL)
    #[arg(long)]
    backend_url: Option<String>,

    /// Access key of the hosted backend (defaults to $TEAMGOALS_ACCESS_KEY)
    #[arg(long)]
    access_key: Option<String>,

    /// Embedded database url, used when no backend url is given
    #[arg(long)]
    db_url: Option<String>,

    /// Team to fetch or create
    #[arg(long)]
    team_id: Option<String>,

    /// Goal listing order
    #[arg(long, value_enum, default_value_t = GoalOrder::Asc)]
    goal_order: GoalOrder,

    /// Log filter (RUST_LOG takes precedence)
    #[arg(long, default_value = "info,teamgoals_sdk_core_rust=debug,sqlx=warn")]
    log_level: String,

    /// Also append logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum GoalOrder {
    /// Oldest first
    Asc,
    /// Newest first
    Desc,
}

impl From<GoalOrder> for SortOrder {
    fn from(order: GoalOrder) -> Self {
        match order {
            GoalOrder::Asc => SortOrder::Ascending,
            GoalOrder::Desc => SortOrder::Descending,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create member, OKR, goal and comment, then delete the goal
    Demo,
    /// Print the team, members, OKRs and goals
    Show,
    /// Print the report series
    Report {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Log change notifications
    Watch {
        /// Seconds to run, 0 runs until Ctrl+C
        #[arg(short, long, default_value = "0")]
        duration: u64,
    },
    AddMember {
        name: String,
    },
    AddObjective {
        title: String,
        #[arg(long)]
        description: Option<String>,
    },
    AddGoal {
        description: String,
        /// Member id
        #[arg(long)]
        member: String,
        /// OKR id
        #[arg(long)]
        okr: String,
    },
    SetStatus {
        goal_id: String,
        /// not_started, in_progress or completed
        status: String,
    },
    SetProgress {
        okr_id: String,
        /// Value in [0, 1]
        value: f64,
    },
    Comment {
        goal_id: String,
        text: String,
    },
}

/// Installs the stdout layer and, when requested, a file layer
fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // RUST_LOG wins over the command line
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(false)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file {
        info!("[CLI] 📝 logging to stdout and {}", path.display());
    }
    Ok(())
}

struct CliListener;

#[async_trait::async_trait]
impl SyncListener for CliListener {
    async fn on_success(&self, message: String) {
        info!("[CLI] ✅ {}", message);
    }

    async fn on_failure(&self, message: String, error: String) {
        error!("[CLI] ❌ {}: {}", message, error);
    }

    async fn on_store_changed(&self, store: StoreKind) {
        debug!("[CLI] 🔄 {} changed", store);
    }
}

fn build_config(args: &Args) -> Result<ClientConfig> {
    let mut config = match (&args.backend_url, &args.access_key, &args.db_url) {
        (Some(url), Some(key), _) => ClientConfig::remote(url, key),
        (Some(_), None, _) => anyhow::bail!("--backend-url needs --access-key"),
        (None, _, Some(db_url)) => ClientConfig::sqlite(db_url),
        (None, _, None) => ClientConfig::from_env()?,
    };
    if let Some(team_id) = &args.team_id {
        config = config.with_team_id(team_id);
    }
    Ok(config.with_goal_order(args.goal_order.into()))
}

async fn show(client: &TeamGoalsClient) -> Result<()> {
    let team = client.teams()?.snapshot().await;
    match &team.team {
        Some(t) => info!(
            "[CLI] 👥 team {} ({}) {}",
            t.name,
            t.id,
            t.icon_value.as_deref().unwrap_or("")
        ),
        None => info!("[CLI] no team loaded: {:?}", team.error),
    }
    for member in &team.members {
        info!("[CLI]   member {} | {}", member.id, member.name);
    }
    for okr in client.objectives()?.objectives().await {
        info!(
            "[CLI]   OKR {} | {} | {:.0}% ({})",
            okr.id,
            okr.title,
            okr.progress * 100.0,
            progress_color(okr.progress)
        );
    }
    for goal in client.goals()?.goals().await {
        info!(
            "[CLI]   goal {} | {} | {} | {} comments",
            goal.id,
            goal.description,
            format_status(goal.status.as_str()),
            goal.comments.len()
        );
    }
    Ok(())
}

async fn report(client: &TeamGoalsClient, json: bool) -> Result<()> {
    let report = client.report().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    for row in &report.members_by_okr {
        info!("[CLI] 📊 {}: {} members", row.title, row.count);
    }
    for row in &report.goals_by_okr {
        info!(
            "[CLI] 📊 {}: {} not started, {} in progress, {} completed",
            row.title, row.not_started, row.in_progress, row.completed
        );
    }
    for slice in &report.status_breakdown {
        info!("[CLI] 📊 {} ({}): {}", slice.label, slice.color, slice.value);
    }
    Ok(())
}

async fn demo(client: &TeamGoalsClient) -> Result<()> {
    let teams = client.teams()?;
    let objectives = client.objectives()?;
    let goals = client.goals()?;

    let bob = teams.add_member("Bob").await?;
    let okr = objectives.add_objective("Ship v1", None).await?;
    let goal = goals
        .add_goal(GoalInput {
            description: "Draft release notes".to_string(),
            team_member_id: bob.id.clone(),
            okr_id: okr.id.clone(),
        })
        .await?;
    info!("[CLI] goal {} is {}", goal.id, goal.status);

    goals.update_status(&goal.id, GoalStatus::InProgress).await?;
    goals.add_comment(&goal.id, "started").await?;
    objectives.update_progress(&okr.id, 0.5).await?;
    show(client).await?;
    report(client, false).await?;

    goals.delete_goal(&goal.id).await?;
    let remaining = goals.list_goals().await?;
    info!(
        "[CLI] goal deleted, {} goals left (deleted one present: {})",
        remaining.len(),
        remaining.iter().any(|g| g.id == goal.id)
    );
    Ok(())
}

async fn watch(duration: u64) -> Result<()> {
    if duration > 0 {
        info!("[CLI] ⏰ exiting after {} seconds", duration);
        sleep(Duration::from_secs(duration)).await;
    } else {
        info!("[CLI] ⏰ watching, press Ctrl+C to exit");
        tokio::signal::ctrl_c().await.context("failed to wait for Ctrl+C")?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(&args.log_level, args.log_file.as_ref())?;

    let config = build_config(&args)?;
    match &config.backend {
        BackendConfig::Remote { url, .. } => info!("[CLI] 🚀 backend: {}", url),
        BackendConfig::Sqlite { db_url } => info!("[CLI] 🚀 embedded database: {}", db_url),
    }

    let mut client = TeamGoalsClient::new(config);
    client.set_listener(Arc::new(CliListener));
    client.connect().await.context("connect failed")?;

    let result = match &args.command {
        Command::Demo => demo(&client).await,
        Command::Show => show(&client).await,
        Command::Report { json } => report(&client, *json).await,
        Command::Watch { duration } => watch(*duration).await,
        Command::AddMember { name } => {
            let mut form = FormState::Creating(MemberDraft { name: name.clone() });
            save_member(&mut form, client.teams()?)
                .await
                .map_err(Into::into)
        }
        Command::AddObjective { title, description } => client
            .objectives()?
            .add_objective(title, description.as_deref())
            .await
            .map(|o| info!("[CLI] OKR id: {}", o.id))
            .map_err(Into::into),
        Command::AddGoal {
            description,
            member,
            okr,
        } => client
            .goals()?
            .add_goal(GoalInput {
                description: description.clone(),
                team_member_id: member.clone(),
                okr_id: okr.clone(),
            })
            .await
            .map(|g| info!("[CLI] goal id: {}", g.id))
            .map_err(Into::into),
        Command::SetStatus { goal_id, status } => match status.parse::<GoalStatus>() {
            Ok(status) => client
                .goals()?
                .update_status(goal_id, status)
                .await
                .map_err(Into::into),
            Err(e) => Err(e),
        },
        Command::SetProgress { okr_id, value } => client
            .objectives()?
            .update_progress(okr_id, *value)
            .await
            .map_err(Into::into),
        Command::Comment { goal_id, text } => client
            .goals()?
            .add_comment(goal_id, text)
            .await
            .map(|c| info!("[CLI] comment id: {}", c.id))
            .map_err(Into::into),
    };

    client.shutdown().await;
    if let Err(e) = &result {
        error!("[CLI] ❌ {:#}", e);
    }
    result
}
