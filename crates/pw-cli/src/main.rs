//! Patchwork CLI - command-line interface for lead organiser patch reconciliation.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use pw_core::{
    Actor, Identity, IdentityKind, JobStatus, LeadPatchAssignment, LiveUser, Patch,
    PatchworkConfig, PendingUser, ProvisionalStatus, ReconcileOutcome, Role, TriggerMode,
    STATE_DIR,
};
use pw_daemon::{Daemon, DaemonConfig};
use pw_storage::{Database, TriggerReport};
use serde::Serialize;
use serde_json::json;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "patchwork")]
#[command(about = "Patchwork - lead organiser patch reconciliation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    /// Override the configured trigger mode (inline or queued)
    #[arg(long, global = true, value_name = "MODE")]
    mode: Option<TriggerMode>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new patchwork repository
    Init {
        /// Path to initialize (defaults to current directory)
        path: Option<String>,
    },

    /// Manage live users
    User {
        #[command(subcommand)]
        action: UserCommands,
    },

    /// Manage provisional (pending) users
    Pending {
        #[command(subcommand)]
        action: PendingCommands,
    },

    /// Manage patches
    Patch {
        #[command(subcommand)]
        action: PatchCommands,
    },

    /// Live lead -> live organiser supervision links
    Link {
        #[command(subcommand)]
        action: LinkCommands,
    },

    /// Links with a provisional end
    Plink {
        #[command(subcommand)]
        action: PlinkCommands,
    },

    /// Assign a patch to a live organiser
    Assign {
        /// Organiser ID
        organiser: String,

        /// Patch ID
        patch: String,
    },

    /// End a live organiser's assignment to a patch
    Unassign {
        /// Organiser ID
        organiser: String,

        /// Patch ID
        patch: String,
    },

    /// Show the computed patch scope of a coordinator
    Scope {
        /// Live or provisional user ID
        id: String,
    },

    /// Reconcile one coordinator now
    Reconcile {
        /// Live or provisional user ID
        id: String,
    },

    /// Reconcile every lead organiser now
    ReconcileAll {
        /// ID of an active admin
        #[arg(long = "as", value_name = "USER")]
        actor: String,
    },

    /// Queue a reconcile job for every lead organiser
    Sweep {
        /// ID of an active admin
        #[arg(long = "as", value_name = "USER")]
        actor: String,
    },

    /// Show a lead organiser's assignment rows
    History {
        /// Lead organiser ID
        lead: String,

        /// Only open rows
        #[arg(short, long)]
        active: bool,
    },

    /// List reconcile jobs
    Jobs {
        /// Filter by status (pending, running, done, failed)
        #[arg(short, long)]
        status: Option<JobStatus>,

        /// Maximum jobs to show (0 = all)
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Process every runnable job once and exit
    Drain,

    /// Start the reconcile worker daemon
    Daemon {
        /// Run in foreground
        #[arg(short, long)]
        foreground: bool,

        /// Serve the monitoring dashboard on the configured address
        #[arg(long)]
        dashboard: bool,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum UserCommands {
    /// Create or update a live user
    Add {
        /// User ID
        id: String,

        #[arg(long)]
        email: String,

        #[arg(long)]
        name: Option<String>,

        /// admin, lead_organiser, organiser, delegate or viewer
        #[arg(long, default_value = "organiser")]
        role: Role,

        /// Store the user as deactivated
        #[arg(long)]
        inactive: bool,
    },

    /// List live users
    List {
        #[arg(long)]
        role: Option<Role>,
    },
}

#[derive(Subcommand)]
enum PendingCommands {
    /// Create or update a provisional user
    Add {
        /// Pending user ID
        id: String,

        #[arg(long)]
        email: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long, default_value = "organiser")]
        role: Role,

        /// draft, invited, activated or archived
        #[arg(long, default_value = "invited")]
        status: ProvisionalStatus,

        /// Directly assigned patch IDs (comma separated)
        #[arg(long, value_delimiter = ',')]
        patches: Vec<String>,
    },

    /// Replace a provisional user's direct patches
    Patches {
        /// Pending user ID
        id: String,

        /// Patch IDs; none clears the list
        patches: Vec<String>,
    },
}

#[derive(Subcommand)]
enum PatchCommands {
    /// Create or rename a patch
    Add {
        /// Patch ID
        id: String,

        /// Display name
        name: String,
    },

    /// List patches
    List,
}

#[derive(Subcommand)]
enum LinkCommands {
    /// Link a live lead to a live organiser
    Add {
        lead: String,
        organiser: String,

        /// First day of supervision (YYYY-MM-DD, default today)
        #[arg(long)]
        start: Option<NaiveDate>,

        /// Last day of supervision (YYYY-MM-DD)
        #[arg(long)]
        end: Option<NaiveDate>,
    },

    /// End a supervision link
    End {
        /// Link ID
        link_id: String,

        /// Last day of supervision; omit to end it now
        #[arg(long)]
        on: Option<NaiveDate>,
    },

    /// List a lead's supervision links
    List { lead: String },
}

#[derive(Subcommand)]
enum PlinkCommands {
    /// Link a lead to an organiser where either end is provisional
    Add {
        lead: String,
        organiser: String,

        #[arg(long, default_value = "live")]
        lead_kind: IdentityKind,

        #[arg(long, default_value = "provisional")]
        organiser_kind: IdentityKind,

        #[arg(long)]
        start: Option<NaiveDate>,

        #[arg(long)]
        end: Option<NaiveDate>,
    },

    /// End a provisional link
    End {
        link_id: String,

        #[arg(long)]
        on: Option<NaiveDate>,
    },

    /// List a lead's provisional links
    List {
        lead: String,

        #[arg(long, default_value = "live")]
        lead_kind: IdentityKind,
    },
}

/// Find the .patchwork directory by walking up from `start`.
fn find_state_dir_from(start: &Path) -> Result<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let state_path = current.join(STATE_DIR);
        if state_path.is_dir() {
            return Ok(state_path);
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => {
                return Err(anyhow::anyhow!(
                    "No {} directory found. Run 'patchwork init' to initialize a repository.",
                    STATE_DIR
                ));
            }
        }
    }
}

/// Bulk commands run as the named live user and must pass the admin check.
fn bulk_actor(user_id: String) -> Actor {
    Actor::user(user_id)
}

/// A discovered repository and its configuration.
struct Repo {
    root: PathBuf,
    config: PatchworkConfig,
}

impl Repo {
    fn discover() -> Result<Self> {
        let state_dir = find_state_dir_from(&env::current_dir()?)?;
        let root = state_dir
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Invalid {} directory structure", STATE_DIR))?
            .to_path_buf();
        let config = PatchworkConfig::load_or_default(&root)?;
        Ok(Self { root, config })
    }

    async fn open(&self, mode: Option<TriggerMode>) -> Result<Database> {
        let db_path = self.config.database_path_in(&self.root);
        let db = Database::open(&db_path)
            .await
            .with_context(|| format!("Failed to open {}", db_path.display()))?;
        Ok(db.with_trigger_mode(mode.unwrap_or(self.config.trigger_mode)))
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_outcome(outcome: &ReconcileOutcome) {
    if outcome.skipped_provisional {
        println!(
            "  {} {} is provisional; scope is computed, not persisted",
            "·".bright_black(),
            outcome.coordinator_id.bright_cyan()
        );
    } else if outcome.is_noop() {
        println!(
            "  {} {} already up to date",
            "·".bright_black(),
            outcome.coordinator_id.bright_cyan()
        );
    } else {
        println!(
            "  {} {}: {} {}",
            "↻".cyan(),
            outcome.coordinator_id.bright_cyan(),
            format!("+{}", outcome.added).green(),
            format!("-{}", outcome.removed).red()
        );
    }
}

fn print_trigger(report: &TriggerReport) {
    if report.affected.is_empty() {
        println!("  {}", "No lead organisers affected".bright_black());
        return;
    }

    if !report.outcomes.is_empty() {
        for outcome in &report.outcomes {
            print_outcome(outcome);
        }
    } else if report.jobs_enqueued > 0 {
        println!(
            "  Queued {} reconcile job(s) for {}",
            report.jobs_enqueued.to_string().bright_green(),
            report.affected.join(", ")
        );
    } else {
        println!(
            "  Reconcile already pending for {}",
            report.affected.join(", ")
        );
    }
}

fn print_assignments(rows: &[LeadPatchAssignment]) {
    if rows.is_empty() {
        println!("{}", "No assignments found".yellow());
        return;
    }

    println!(
        "{:<38} {:<16} {:<20} {}",
        "ID".bold(),
        "PATCH".bold(),
        "FROM".bold(),
        "TO".bold()
    );
    println!("{}", "─".repeat(96));

    for row in rows {
        let to = match row.effective_to {
            Some(ts) => ts.format("%Y-%m-%d %H:%M:%S").to_string().bright_black(),
            None => "open".green(),
        };
        println!(
            "{:<38} {:<16} {:<20} {}",
            row.id.bright_black(),
            row.patch_id.bright_cyan(),
            row.effective_from.format("%Y-%m-%d %H:%M:%S"),
            to
        );
    }
}

fn describe_identity(identity: &Identity) -> String {
    match identity {
        Identity::Live(user) if !user.is_active => format!("inactive live {}", user.role),
        Identity::Live(user) => format!("live {}", user.role),
        Identity::Provisional(pending) => {
            format!("provisional {} ({})", pending.role, pending.status)
        }
        Identity::Unknown => "unknown".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli {
        command,
        verbose,
        json: as_json,
        mode,
    } = Cli::parse();

    // Library outcome logs duplicate what the CLI prints, so default to warn
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    debug!("Patchwork CLI starting");

    match command {
        Commands::Init { path } => {
            let target = path.unwrap_or_else(|| ".".to_string());
            let root = Path::new(&target);

            let config_path = root.join(STATE_DIR).join("config.toml");
            if !config_path.exists() {
                PatchworkConfig::write_default(root)?;
            }
            let config = PatchworkConfig::load_or_default(root)?;

            let db_path = config.database_path_in(root);
            if let Some(parent) = db_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let db = Database::open(&db_path).await?;
            db.init_schema().await?;

            println!("{}", "✓ Initialized patchwork repository".green().bold());
            println!("  Config:   {}", config_path.display());
            println!("  Database: {}", db_path.display());
            println!("  Triggers: {}", config.trigger_mode);

            Ok(())
        }

        Commands::User { action } => {
            let repo = Repo::discover()?;
            let mut db = repo.open(mode).await?;

            match action {
                UserCommands::Add {
                    id,
                    email,
                    name,
                    role,
                    inactive,
                } => {
                    let now = Utc::now();
                    let created_at = match db.get_user(&id).await {
                        Ok(existing) => existing.created_at,
                        Err(_) => now,
                    };
                    let user = LiveUser {
                        id: id.clone(),
                        email,
                        full_name: name,
                        role,
                        is_active: !inactive,
                        created_at,
                        updated_at: now,
                    };
                    let report = db.upsert_user(&user).await?;

                    if as_json {
                        return print_json(&json!({ "user": user, "trigger": report }));
                    }
                    println!("{}", "✓ Saved user".green().bold());
                    println!("  ID:   {}", id.bright_cyan());
                    println!("  Role: {}", role);
                    print_trigger(&report);
                }

                UserCommands::List { role } => {
                    let users = db.list_users(role).await?;
                    if as_json {
                        return print_json(&users);
                    }
                    if users.is_empty() {
                        println!("{}", "No users found".yellow());
                        return Ok(());
                    }

                    println!(
                        "{:<24} {:<16} {:<8} {}",
                        "ID".bold(),
                        "ROLE".bold(),
                        "ACTIVE".bold(),
                        "EMAIL".bold()
                    );
                    println!("{}", "─".repeat(80));
                    for user in users {
                        let active = if user.is_active {
                            "yes".green()
                        } else {
                            "no".red()
                        };
                        println!(
                            "{:<24} {:<16} {:<8} {}",
                            user.id.bright_cyan(),
                            user.role.as_str(),
                            active,
                            user.email
                        );
                    }
                }
            }

            Ok(())
        }

        Commands::Pending { action } => {
            let repo = Repo::discover()?;
            let mut db = repo.open(mode).await?;

            let report = match action {
                PendingCommands::Add {
                    id,
                    email,
                    name,
                    role,
                    status,
                    patches,
                } => {
                    let now = Utc::now();
                    let created_at = match db.get_pending_user(&id).await {
                        Ok(existing) => existing.created_at,
                        Err(_) => now,
                    };
                    let pending = PendingUser {
                        id: id.clone(),
                        email,
                        full_name: name,
                        role,
                        status,
                        assigned_patch_ids: patches,
                        created_at,
                        updated_at: now,
                    };
                    let report = db.upsert_pending_user(&pending).await?;
                    if !as_json {
                        println!("{}", "✓ Saved provisional user".green().bold());
                        println!("  ID:     {}", id.bright_cyan());
                        println!("  Status: {}", status);
                    }
                    report
                }

                PendingCommands::Patches { id, patches } => {
                    let report = db.set_direct_patches(&id, &patches).await?;
                    if !as_json {
                        println!(
                            "{}",
                            format!("✓ {} now holds {} direct patch(es)", id, patches.len())
                                .green()
                                .bold()
                        );
                    }
                    report
                }
            };

            if as_json {
                return print_json(&report);
            }
            print_trigger(&report);
            Ok(())
        }

        Commands::Patch { action } => {
            let repo = Repo::discover()?;
            let db = repo.open(mode).await?;

            match action {
                PatchCommands::Add { id, name } => {
                    let created_at = match db.get_patch(&id).await {
                        Ok(existing) => existing.created_at,
                        Err(_) => Utc::now(),
                    };
                    let patch = Patch {
                        id: id.clone(),
                        name,
                        created_at,
                    };
                    db.upsert_patch(&patch).await?;

                    if as_json {
                        return print_json(&patch);
                    }
                    println!("{}", format!("✓ Saved patch {}", id).green().bold());
                }

                PatchCommands::List => {
                    let patches = db.list_patches().await?;
                    if as_json {
                        return print_json(&patches);
                    }
                    if patches.is_empty() {
                        println!("{}", "No patches found".yellow());
                        return Ok(());
                    }
                    for patch in patches {
                        println!("{:<24} {}", patch.id.bright_cyan(), patch.name);
                    }
                }
            }

            Ok(())
        }

        Commands::Link { action } => {
            let repo = Repo::discover()?;
            let mut db = repo.open(mode).await?;
            let today = Utc::now().date_naive();

            let report = match action {
                LinkCommands::Add {
                    lead,
                    organiser,
                    start,
                    end,
                } => {
                    let (link, report) = db
                        .add_supervision_link(&lead, &organiser, start.unwrap_or(today), end)
                        .await?;
                    if as_json {
                        return print_json(&json!({ "link": link, "trigger": report }));
                    }
                    println!("{}", "✓ Linked lead to organiser".green().bold());
                    println!("  Link: {}", link.id.bright_cyan());
                    println!("  {} -> {} from {}", lead, organiser, link.start_date);
                    report
                }

                LinkCommands::End { link_id, on } => {
                    let report = db.end_supervision_link(&link_id, on).await?;
                    if as_json {
                        return print_json(&report);
                    }
                    println!("{}", format!("✓ Ended link {}", link_id).green().bold());
                    report
                }

                LinkCommands::List { lead } => {
                    let links = db.supervision_links_for_lead(&lead).await?;
                    if as_json {
                        return print_json(&links);
                    }
                    if links.is_empty() {
                        println!("{}", "No links found".yellow());
                    }
                    for link in links {
                        let state = if link.is_active_on(today) {
                            "active".green()
                        } else {
                            "inactive".bright_black()
                        };
                        let end = link
                            .end_date
                            .map(|d| d.to_string())
                            .unwrap_or_else(|| "-".to_string());
                        println!(
                            "{:<38} {:<20} {} .. {:<10} {}",
                            link.id.bright_black(),
                            link.organiser_id.bright_cyan(),
                            link.start_date,
                            end,
                            state
                        );
                    }
                    return Ok(());
                }
            };

            print_trigger(&report);
            Ok(())
        }

        Commands::Plink { action } => {
            let repo = Repo::discover()?;
            let mut db = repo.open(mode).await?;
            let today = Utc::now().date_naive();

            let report = match action {
                PlinkCommands::Add {
                    lead,
                    organiser,
                    lead_kind,
                    organiser_kind,
                    start,
                    end,
                } => {
                    let (link, report) = db
                        .add_provisional_link(
                            lead_kind,
                            &lead,
                            organiser_kind,
                            &organiser,
                            start.unwrap_or(today),
                            end,
                        )
                        .await?;
                    if as_json {
                        return print_json(&json!({ "link": link, "trigger": report }));
                    }
                    println!("{}", "✓ Linked provisional hierarchy".green().bold());
                    println!("  Link: {}", link.id.bright_cyan());
                    println!(
                        "  {}:{} -> {}:{} from {}",
                        lead_kind, lead, organiser_kind, organiser, link.start_date
                    );
                    report
                }

                PlinkCommands::End { link_id, on } => {
                    let report = db.end_provisional_link(&link_id, on).await?;
                    if as_json {
                        return print_json(&report);
                    }
                    println!("{}", format!("✓ Ended link {}", link_id).green().bold());
                    report
                }

                PlinkCommands::List { lead, lead_kind } => {
                    let links = db.provisional_links_for_lead(lead_kind, &lead).await?;
                    if as_json {
                        return print_json(&links);
                    }
                    if links.is_empty() {
                        println!("{}", "No links found".yellow());
                    }
                    for link in links {
                        let state = if link.is_active_on(today) {
                            "active".green()
                        } else {
                            "inactive".bright_black()
                        };
                        println!(
                            "{:<38} {:<12} {:<20} {} {}",
                            link.id.bright_black(),
                            link.organiser_kind.as_str(),
                            link.organiser_id.bright_cyan(),
                            link.start_date,
                            state
                        );
                    }
                    return Ok(());
                }
            };

            print_trigger(&report);
            Ok(())
        }

        Commands::Assign { organiser, patch } => {
            let repo = Repo::discover()?;
            let mut db = repo.open(mode).await?;

            let (assignment, report) = db.assign_organiser_patch(&organiser, &patch).await?;
            if as_json {
                return print_json(&json!({ "assignment": assignment, "trigger": report }));
            }
            println!(
                "{}",
                format!("✓ {} assigned to {}", patch, organiser).green().bold()
            );
            print_trigger(&report);
            Ok(())
        }

        Commands::Unassign { organiser, patch } => {
            let repo = Repo::discover()?;
            let mut db = repo.open(mode).await?;

            let report = db.end_organiser_patch(&organiser, &patch).await?;
            if as_json {
                return print_json(&report);
            }
            println!(
                "{}",
                format!("✓ {} no longer assigned to {}", patch, organiser)
                    .green()
                    .bold()
            );
            print_trigger(&report);
            Ok(())
        }

        Commands::Scope { id } => {
            let repo = Repo::discover()?;
            let db = repo.open(mode).await?;

            let identity = db.resolve_identity(&id).await?;
            let scope = db.compute_scope(&id).await?;

            if as_json {
                return print_json(&json!({
                    "id": id,
                    "identity": describe_identity(&identity),
                    "patches": scope,
                }));
            }

            println!("{} ({})", id.bright_cyan().bold(), describe_identity(&identity));
            if identity.coordinator().is_none() {
                println!("  {}", "Not a lead organiser; scope is empty".yellow());
                return Ok(());
            }
            if scope.is_empty() {
                println!("  {}", "No patches in scope".yellow());
            }
            for patch_id in scope {
                println!("  {}", patch_id);
            }
            Ok(())
        }

        Commands::Reconcile { id } => {
            let repo = Repo::discover()?;
            let mut db = repo.open(mode).await?;

            let outcome = db.reconcile(&id).await?;
            if as_json {
                return print_json(&outcome);
            }
            print_outcome(&outcome);
            Ok(())
        }

        Commands::ReconcileAll { actor } => {
            let repo = Repo::discover()?;
            let mut db = repo.open(mode).await?;

            let summary = db.reconcile_all(&bulk_actor(actor)).await?;
            if as_json {
                return print_json(&summary);
            }

            println!("{}", "✓ Reconciliation complete".green().bold());
            println!(
                "  Coordinators: {}",
                summary.coordinators_processed.to_string().bright_green()
            );
            println!("  Added:        {}", summary.total_added.to_string().green());
            println!("  Removed:      {}", summary.total_removed.to_string().red());

            if summary.has_errors() {
                println!("{}", "⚠ Some coordinators failed:".yellow().bold());
                for failure in &summary.failures {
                    println!(
                        "  {}: {}",
                        failure.coordinator_id.bright_cyan(),
                        failure.error.bright_red()
                    );
                }
            }
            Ok(())
        }

        Commands::Sweep { actor } => {
            let repo = Repo::discover()?;
            let mut db = repo.open(mode).await?;

            let inserted = db.enqueue_sweep(&bulk_actor(actor)).await?;
            if as_json {
                return print_json(&json!({ "jobs_enqueued": inserted }));
            }
            println!(
                "{}",
                format!("✓ Queued {} reconcile job(s)", inserted).green().bold()
            );
            println!("  Run 'patchwork drain' or the daemon to apply them");
            Ok(())
        }

        Commands::History { lead, active } => {
            let repo = Repo::discover()?;
            let db = repo.open(mode).await?;

            let rows = if active {
                db.active_lead_patches(&lead).await?
            } else {
                db.lead_patch_history(&lead).await?
            };
            if as_json {
                return print_json(&rows);
            }
            print_assignments(&rows);
            Ok(())
        }

        Commands::Jobs { status, limit } => {
            let repo = Repo::discover()?;
            let db = repo.open(mode).await?;

            let jobs = db.list_jobs(status, limit).await?;
            if as_json {
                return print_json(&jobs);
            }

            let counts = db.job_counts().await?;
            println!(
                "pending {}  running {}  done {}  failed {}",
                counts.pending.to_string().yellow(),
                counts.running.to_string().cyan(),
                counts.done.to_string().green(),
                counts.failed.to_string().red()
            );
            if jobs.is_empty() {
                println!("{}", "No jobs found".yellow());
                return Ok(());
            }

            println!(
                "{:<38} {:<20} {:<8} {:<4} {}",
                "ID".bold(),
                "COORDINATOR".bold(),
                "STATUS".bold(),
                "TRY".bold(),
                "REASON".bold()
            );
            println!("{}", "─".repeat(96));
            for job in jobs {
                let status_colored = match job.status {
                    JobStatus::Pending => job.status.as_str().yellow(),
                    JobStatus::Running => job.status.as_str().cyan(),
                    JobStatus::Done => job.status.as_str().green(),
                    JobStatus::Failed => job.status.as_str().red(),
                };
                println!(
                    "{:<38} {:<20} {:<8} {:<4} {}",
                    job.id.bright_black(),
                    job.coordinator_id.bright_cyan(),
                    status_colored,
                    job.attempts,
                    job.reason
                );
                if let Some(error) = job.last_error {
                    println!("  {}", error.bright_red());
                }
            }
            Ok(())
        }

        Commands::Drain => {
            let repo = Repo::discover()?;
            let db = repo.open(mode).await?;
            let daemon = Daemon::new_with_config(
                Arc::new(RwLock::new(db)),
                DaemonConfig::from(&repo.config.worker),
            );

            let report = daemon.drain().await?;
            if as_json {
                return print_json(&json!({
                    "claimed": report.claimed,
                    "completed": report.completed,
                    "retried": report.retried,
                    "failed": report.failed,
                    "assignments_added": report.assignments_added,
                    "assignments_removed": report.assignments_removed,
                }));
            }

            println!("{}", "✓ Queue drained".green().bold());
            println!("  Jobs completed:  {}", report.completed.to_string().bright_green());
            println!(
                "  Rows:            {} {}",
                format!("+{}", report.assignments_added).green(),
                format!("-{}", report.assignments_removed).red()
            );
            if report.retried > 0 || report.failed > 0 {
                println!("{}", "⚠ Some jobs failed:".yellow().bold());
                println!("  Retrying:        {}", report.retried.to_string().yellow());
                println!("  Parked:          {}", report.failed.to_string().bright_red());
            }
            Ok(())
        }

        Commands::Daemon {
            foreground,
            dashboard,
        } => {
            let repo = Repo::discover()?;

            if !foreground {
                println!(
                    "{}",
                    "Note: Background daemonization is OS-specific and not yet implemented."
                        .yellow()
                );
                println!("Run with --foreground to run in the current terminal:");
                println!("  patchwork daemon --foreground");
                return Ok(());
            }

            let db = repo.open(mode).await?;
            db.init_schema().await?;
            let storage = Arc::new(RwLock::new(db));
            let config = DaemonConfig::from(&repo.config.worker);

            println!("{}", "Starting daemon in foreground...".green());
            println!(
                "  Database: {}",
                repo.config.database_path_in(&repo.root).display()
            );
            println!("  Workers:  {}", config.worker_count);
            println!("  Press Ctrl+C to stop");

            #[allow(unused_mut)]
            let mut daemon = Daemon::new_with_config(storage.clone(), config);

            #[cfg(feature = "dashboard")]
            {
                if dashboard {
                    use pw_daemon::dashboard::{DaemonStats, DashboardServer};

                    let addr: std::net::SocketAddr =
                        repo.config.dashboard.bind_addr.parse().with_context(|| {
                            format!("Invalid dashboard address {}", repo.config.dashboard.bind_addr)
                        })?;
                    let stats = Arc::new(DaemonStats::new());
                    let bound = DashboardServer::new(addr, stats.clone(), Some(storage.clone()))
                        .start()
                        .await?;
                    println!("  Dashboard: http://{}", bound);
                    daemon = daemon.with_stats(stats);
                }
            }
            #[cfg(not(feature = "dashboard"))]
            {
                if dashboard {
                    println!("{}", "Note: built without dashboard support".yellow());
                }
            }
            println!();

            let shutdown = daemon.shutdown_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    println!("\n{}", "Shutting down...".yellow());
                    let _ = shutdown.send(()).await;
                }
            });

            daemon.run().await?;

            println!("{}", "✓ Daemon stopped".green());
            Ok(())
        }

        Commands::Version => {
            println!("patchwork {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_find_state_dir_walks_up() {
        let temp_dir = TempDir::new().unwrap();
        let state_dir = temp_dir.path().join(STATE_DIR);
        let nested = temp_dir.path().join("a").join("b");
        std::fs::create_dir_all(&state_dir).unwrap();
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_state_dir_from(&nested).unwrap();
        assert_eq!(found, state_dir);
    }

    #[test]
    fn test_parse_bulk_actor() {
        let cli = Cli::try_parse_from(["patchwork", "sweep", "--as", "admin-1"]).unwrap();
        match cli.command {
            Commands::Sweep { actor } => {
                assert_eq!(bulk_actor(actor), Actor::User("admin-1".to_string()))
            }
            _ => panic!("expected sweep"),
        }
    }

    #[tokio::test]
    async fn test_bulk_commands_cannot_act_as_system() {
        let temp_dir = TempDir::new().unwrap();
        let mut db = Database::open(temp_dir.path().join("cli.db")).await.unwrap();
        db.init_schema().await.unwrap();
        db.upsert_user(&LiveUser {
            id: "org-1".to_string(),
            email: "org-1@example.org".to_string(),
            full_name: None,
            role: Role::Organiser,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

        for who in ["system", "org-1"] {
            let cli =
                Cli::try_parse_from(["patchwork", "reconcile-all", "--as", who]).unwrap();
            let Commands::ReconcileAll { actor } = cli.command else {
                panic!("expected reconcile-all");
            };
            let actor = bulk_actor(actor);
            assert_ne!(actor, Actor::System);

            let err = db.reconcile_all(&actor).await.unwrap_err();
            assert!(matches!(err, pw_storage::DbError::Unauthorized(_)), "{} passed", who);
            let err = db.enqueue_sweep(&actor).await.unwrap_err();
            assert!(matches!(err, pw_storage::DbError::Unauthorized(_)));
        }
    }

    #[test]
    fn test_parse_plink_kinds_and_dates() {
        let cli = Cli::try_parse_from([
            "patchwork",
            "--mode",
            "inline",
            "plink",
            "add",
            "pend-lead",
            "org-1",
            "--lead-kind",
            "provisional",
            "--organiser-kind",
            "live",
            "--start",
            "2024-03-01",
        ])
        .unwrap();

        assert_eq!(cli.mode, Some(TriggerMode::Inline));
        match cli.command {
            Commands::Plink {
                action:
                    PlinkCommands::Add {
                        lead_kind,
                        organiser_kind,
                        start,
                        end,
                        ..
                    },
            } => {
                assert_eq!(lead_kind, IdentityKind::Provisional);
                assert_eq!(organiser_kind, IdentityKind::Live);
                assert_eq!(start, NaiveDate::from_ymd_opt(2024, 3, 1));
                assert_eq!(end, None);
            }
            _ => panic!("expected plink add"),
        }
    }

    #[test]
    fn test_parse_pending_patches_list() {
        let cli = Cli::try_parse_from([
            "patchwork",
            "pending",
            "add",
            "pend-1",
            "--email",
            "p@example.org",
            "--role",
            "lead_organiser",
            "--patches",
            "p1,p2",
        ])
        .unwrap();

        match cli.command {
            Commands::Pending {
                action: PendingCommands::Add { role, patches, status, .. },
            } => {
                assert_eq!(role, Role::LeadOrganiser);
                assert_eq!(status, ProvisionalStatus::Invited);
                assert_eq!(patches, vec!["p1".to_string(), "p2".to_string()]);
            }
            _ => panic!("expected pending add"),
        }
    }

    #[test]
    fn test_rejects_unknown_role() {
        assert!(Cli::try_parse_from([
            "patchwork", "user", "add", "u1", "--email", "u@example.org", "--role", "boss",
        ])
        .is_err());
    }
}
