//! Database layer for patchwork using Turso.
//!
//! Architecture:
//!   - Database file: .patchwork/patchwork.db
//!   - WAL mode: Write-Ahead Logging for concurrent reads during writes
//!   - Schema: users, pending_users, patches, the two supervision link
//!     tables, organiser and lead patch assignments, reconcile_jobs
//!   - Every hierarchy write runs in one transaction together with its
//!     change-detection trigger, so a write and its reconciliation (or its
//!     queued job) commit or roll back as a unit.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use pw_core::{
    IdentityKind, LeadPatchAssignment, LiveUser, OrganiserPatchAssignment, Patch, PatchId,
    PendingUser, ProvisionalLink, ProvisionalStatus, Role, SupervisionLink, TriggerMode,
};
use std::path::Path;
use tracing::{debug, info};
use turso::{params, Builder, Connection};

use crate::triggers::{self, HierarchyChange, TriggerReport};

/// Database connection wrapper for Turso
pub struct Database {
    pub(crate) conn: Connection,
    path: String,
    trigger_mode: TriggerMode,
}

/// Database errors
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("turso error: {0}")]
    Turso(#[from] turso::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("core error: {0}")]
    Core(#[from] pw_core::Error),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("link not found: {0}")]
    LinkNotFound(String),

    #[error("patch not found: {0}")]
    PatchNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Commits `$tx` when `$result` is `Ok` and rolls it back otherwise.
///
/// Evaluates to the `Result`, with a failed commit surfacing as the error.
macro_rules! finish_tx {
    ($tx:ident, $result:expr) => {
        match $result {
            Ok(value) => match $tx.commit().await {
                Ok(()) => Ok(value),
                Err(err) => Err($crate::db::DbError::from(err)),
            },
            Err(err) => {
                if let Err(rollback_err) = $tx.rollback().await {
                    tracing::warn!("rollback failed: {}", rollback_err);
                }
                Err(err)
            }
        }
    };
}
pub(crate) use finish_tx;

/// Returns the first row of `rows`, stepping the statement to completion.
///
/// A statement left mid-step inside a transaction ends that transaction, so
/// every single-row lookup goes through here rather than calling `next` once.
pub(crate) async fn first_row(mut rows: turso::Rows) -> Result<Option<turso::Row>> {
    let first = rows.next().await?;
    if first.is_some() {
        while rows.next().await?.is_some() {}
    }
    Ok(first)
}

impl Database {
    /// Open creates a new database connection at the specified path using Turso.
    ///
    /// The database is opened in embedded mode with WAL for concurrent reads.
    /// Hierarchy writes reconcile inline ([`TriggerMode::Inline`]) until
    /// [`Database::set_trigger_mode`] says otherwise.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use pw_storage::Database;
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let db = Database::open(".patchwork/patchwork.db").await?;
    /// db.init_schema().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        if let Some(parent) = path.as_ref().parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db = Builder::new_local(&path_str).build().await?;
        let conn = db.connect()?;

        // PRAGMA statements may return rows, so they go through query()
        let _ = conn.query("PRAGMA journal_mode=WAL", params![]).await?;
        let _ = conn.query("PRAGMA busy_timeout=5000", params![]).await?;
        let _ = conn.query("PRAGMA foreign_keys=ON", params![]).await?;

        debug!("Opened database at {}", path_str);

        Ok(Database {
            conn,
            path: path_str,
            trigger_mode: TriggerMode::default(),
        })
    }

    /// Returns the database file path
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn trigger_mode(&self) -> TriggerMode {
        self.trigger_mode
    }

    /// Choose how hierarchy writes dispatch reconciliation.
    pub fn set_trigger_mode(&mut self, mode: TriggerMode) {
        self.trigger_mode = mode;
    }

    /// Builder-style variant of [`Database::set_trigger_mode`].
    pub fn with_trigger_mode(mut self, mode: TriggerMode) -> Self {
        self.trigger_mode = mode;
        self
    }

    /// InitSchema creates the database schema if it doesn't exist.
    ///
    /// Idempotent. Foreign keys are declared for documentation and for
    /// stores that enforce them; writes also check referenced rows in code.
    pub async fn init_schema(&self) -> Result<()> {
        let statements = vec![
            r#"CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                full_name TEXT,
                role TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS pending_users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                full_name TEXT,
                role TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'draft',
                assigned_patch_ids TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS patches (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            // Live lead -> live organiser
            r#"CREATE TABLE IF NOT EXISTS lead_organiser_links (
                id TEXT PRIMARY KEY,
                lead_id TEXT NOT NULL,
                organiser_id TEXT NOT NULL,
                start_date TEXT NOT NULL,
                end_date TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                FOREIGN KEY (lead_id) REFERENCES users(id),
                FOREIGN KEY (organiser_id) REFERENCES users(id)
            )"#,
            // Links with at least one provisional end; ends are polymorphic
            r#"CREATE TABLE IF NOT EXISTS provisional_links (
                id TEXT PRIMARY KEY,
                lead_kind TEXT NOT NULL,
                lead_id TEXT NOT NULL,
                organiser_kind TEXT NOT NULL,
                organiser_id TEXT NOT NULL,
                start_date TEXT NOT NULL,
                end_date TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS organiser_patch_assignments (
                id TEXT PRIMARY KEY,
                organiser_id TEXT NOT NULL,
                patch_id TEXT NOT NULL,
                effective_from TEXT NOT NULL,
                effective_to TEXT,
                FOREIGN KEY (organiser_id) REFERENCES users(id),
                FOREIGN KEY (patch_id) REFERENCES patches(id)
            )"#,
            // Written only by the reconciler
            r#"CREATE TABLE IF NOT EXISTS lead_patch_assignments (
                id TEXT PRIMARY KEY,
                lead_id TEXT NOT NULL,
                patch_id TEXT NOT NULL,
                effective_from TEXT NOT NULL,
                effective_to TEXT,
                FOREIGN KEY (lead_id) REFERENCES users(id),
                FOREIGN KEY (patch_id) REFERENCES patches(id)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS reconcile_jobs (
                id TEXT PRIMARY KEY,
                coordinator_id TEXT NOT NULL,
                reason TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                enqueued_at TEXT NOT NULL,
                available_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_users_role ON users(role, is_active)",
            "CREATE INDEX IF NOT EXISTS idx_links_lead ON lead_organiser_links(lead_id)",
            "CREATE INDEX IF NOT EXISTS idx_links_organiser ON lead_organiser_links(organiser_id)",
            "CREATE INDEX IF NOT EXISTS idx_plinks_lead ON provisional_links(lead_kind, lead_id)",
            "CREATE INDEX IF NOT EXISTS idx_plinks_organiser ON provisional_links(organiser_kind, organiser_id)",
            "CREATE INDEX IF NOT EXISTS idx_opa_organiser ON organiser_patch_assignments(organiser_id, effective_to)",
            "CREATE INDEX IF NOT EXISTS idx_lpa_lead ON lead_patch_assignments(lead_id, effective_to)",
            "CREATE INDEX IF NOT EXISTS idx_lpa_patch ON lead_patch_assignments(patch_id)",
            "CREATE INDEX IF NOT EXISTS idx_jobs_status ON reconcile_jobs(status, available_at)",
            "CREATE INDEX IF NOT EXISTS idx_jobs_coordinator ON reconcile_jobs(coordinator_id, status)",
        ];

        for stmt in statements {
            self.conn.execute(stmt, params![]).await?;
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Upstream writes. Each one fires its change-detection trigger.
    // ------------------------------------------------------------------

    /// Insert or update a live user.
    ///
    /// A role or activation change reconciles the user themself, so a
    /// demoted or deactivated lead has their rows closed and a promoted
    /// one gains rows.
    pub async fn upsert_user(&mut self, user: &LiveUser) -> Result<TriggerReport> {
        user.validate()?;

        let mode = self.trigger_mode;
        let tx = self.conn.transaction().await?;
        let result: Result<TriggerReport> = async {
            tx.execute(
                r#"
                INSERT INTO users (id, email, full_name, role, is_active, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    email = excluded.email,
                    full_name = excluded.full_name,
                    role = excluded.role,
                    is_active = excluded.is_active,
                    updated_at = excluded.updated_at
                "#,
                params![
                    user.id.clone(),
                    user.email.clone(),
                    user.full_name.clone(),
                    user.role.as_str(),
                    user.is_active as i64,
                    timestamp(user.created_at),
                    timestamp(user.updated_at),
                ],
            )
            .await?;

            let change = HierarchyChange::LiveUser {
                user_id: user.id.clone(),
            };
            triggers::dispatch(&tx, mode, &change).await
        }
        .await;

        finish_tx!(tx, result)
    }

    /// Insert or update a provisional user, including its direct patches.
    ///
    /// Live leads supervising this identity through a provisional link are
    /// reconciled, since an archive or a patch change alters their scope.
    pub async fn upsert_pending_user(&mut self, pending: &PendingUser) -> Result<TriggerReport> {
        pending.validate()?;

        let patch_ids = dedup_patch_ids(&pending.assigned_patch_ids);
        let patch_json = serde_json::to_string(&patch_ids)?;

        let mode = self.trigger_mode;
        let tx = self.conn.transaction().await?;
        let result: Result<TriggerReport> = async {
            ensure_patches_exist(&tx, &patch_ids).await?;

            tx.execute(
                r#"
                INSERT INTO pending_users (
                    id, email, full_name, role, status, assigned_patch_ids,
                    created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    email = excluded.email,
                    full_name = excluded.full_name,
                    role = excluded.role,
                    status = excluded.status,
                    assigned_patch_ids = excluded.assigned_patch_ids,
                    updated_at = excluded.updated_at
                "#,
                params![
                    pending.id.clone(),
                    pending.email.clone(),
                    pending.full_name.clone(),
                    pending.role.as_str(),
                    pending.status.as_str(),
                    patch_json,
                    timestamp(pending.created_at),
                    timestamp(pending.updated_at),
                ],
            )
            .await?;

            let change = HierarchyChange::DirectPatches {
                pending_id: pending.id.clone(),
            };
            triggers::dispatch(&tx, mode, &change).await
        }
        .await;

        finish_tx!(tx, result)
    }

    /// Replace the direct patch list of a provisional user.
    pub async fn set_direct_patches(
        &mut self,
        pending_id: &str,
        patch_ids: &[PatchId],
    ) -> Result<TriggerReport> {
        let patch_ids = dedup_patch_ids(patch_ids);
        let patch_json = serde_json::to_string(&patch_ids)?;

        let mode = self.trigger_mode;
        let tx = self.conn.transaction().await?;
        let result: Result<TriggerReport> = async {
            ensure_patches_exist(&tx, &patch_ids).await?;

            let changed = tx
                .execute(
                    "UPDATE pending_users SET assigned_patch_ids = ?, updated_at = ? WHERE id = ?",
                    params![patch_json, timestamp(Utc::now()), pending_id],
                )
                .await?;
            if changed == 0 {
                return Err(DbError::UserNotFound(pending_id.to_string()));
            }

            let change = HierarchyChange::DirectPatches {
                pending_id: pending_id.to_string(),
            };
            triggers::dispatch(&tx, mode, &change).await
        }
        .await;

        finish_tx!(tx, result)
    }

    /// Insert or update a patch. Patches carry no hierarchy, so no trigger fires.
    pub async fn upsert_patch(&self, patch: &Patch) -> Result<()> {
        patch.validate()?;

        self.conn
            .execute(
                r#"
                INSERT INTO patches (id, name, created_at) VALUES (?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET name = excluded.name
                "#,
                params![patch.id.clone(), patch.name.clone(), timestamp(patch.created_at)],
            )
            .await?;

        Ok(())
    }

    /// Create a supervision link from a live lead to a live organiser.
    pub async fn add_supervision_link(
        &mut self,
        lead_id: &str,
        organiser_id: &str,
        start_date: NaiveDate,
        end_date: Option<NaiveDate>,
    ) -> Result<(SupervisionLink, TriggerReport)> {
        let link = SupervisionLink {
            id: uuid::Uuid::new_v4().to_string(),
            lead_id: lead_id.to_string(),
            organiser_id: organiser_id.to_string(),
            start_date,
            end_date,
            is_active: true,
        };
        link.validate()?;

        let mode = self.trigger_mode;
        let tx = self.conn.transaction().await?;
        let result: Result<TriggerReport> = async {
            ensure_identity_exists(&tx, IdentityKind::Live, &link.lead_id).await?;
            ensure_identity_exists(&tx, IdentityKind::Live, &link.organiser_id).await?;

            tx.execute(
                r#"
                INSERT INTO lead_organiser_links (
                    id, lead_id, organiser_id, start_date, end_date, is_active, created_at
                ) VALUES (?, ?, ?, ?, ?, 1, ?)
                "#,
                params![
                    link.id.clone(),
                    link.lead_id.clone(),
                    link.organiser_id.clone(),
                    day(link.start_date),
                    link.end_date.map(day),
                    timestamp(Utc::now()),
                ],
            )
            .await?;

            let change = HierarchyChange::SupervisionLink {
                lead_id: link.lead_id.clone(),
            };
            triggers::dispatch(&tx, mode, &change).await
        }
        .await;

        let report = finish_tx!(tx, result)?;
        Ok((link, report))
    }

    /// End a supervision link.
    ///
    /// `None` deactivates the link immediately. `Some(date)` schedules the
    /// end; the link stays in scope through that date inclusive and the
    /// periodic sweep picks up the expiry.
    pub async fn end_supervision_link(
        &mut self,
        link_id: &str,
        end_date: Option<NaiveDate>,
    ) -> Result<TriggerReport> {
        let mode = self.trigger_mode;
        let tx = self.conn.transaction().await?;
        let result: Result<TriggerReport> = async {
            let mut link = fetch_supervision_link(&tx, link_id)
                .await?
                .ok_or_else(|| DbError::LinkNotFound(link_id.to_string()))?;
            apply_end(&mut link.end_date, &mut link.is_active, link.start_date, end_date);
            link.validate()?;

            tx.execute(
                "UPDATE lead_organiser_links SET end_date = ?, is_active = ? WHERE id = ?",
                params![link.end_date.map(day), link.is_active as i64, link_id],
            )
            .await?;
            info!("Ended supervision link {} ({} -> {})", link_id, link.lead_id, link.organiser_id);

            let change = HierarchyChange::SupervisionLink {
                lead_id: link.lead_id.clone(),
            };
            triggers::dispatch(&tx, mode, &change).await
        }
        .await;

        finish_tx!(tx, result)
    }

    /// Create a link with at least one provisional end.
    ///
    /// Live lead to provisional organiser, or provisional lead to a live or
    /// provisional organiser.
    pub async fn add_provisional_link(
        &mut self,
        lead_kind: IdentityKind,
        lead_id: &str,
        organiser_kind: IdentityKind,
        organiser_id: &str,
        start_date: NaiveDate,
        end_date: Option<NaiveDate>,
    ) -> Result<(ProvisionalLink, TriggerReport)> {
        let link = ProvisionalLink {
            id: uuid::Uuid::new_v4().to_string(),
            lead_kind,
            lead_id: lead_id.to_string(),
            organiser_kind,
            organiser_id: organiser_id.to_string(),
            start_date,
            end_date,
            is_active: true,
        };
        link.validate()?;

        let mode = self.trigger_mode;
        let tx = self.conn.transaction().await?;
        let result: Result<TriggerReport> = async {
            ensure_identity_exists(&tx, link.lead_kind, &link.lead_id).await?;
            ensure_identity_exists(&tx, link.organiser_kind, &link.organiser_id).await?;

            tx.execute(
                r#"
                INSERT INTO provisional_links (
                    id, lead_kind, lead_id, organiser_kind, organiser_id,
                    start_date, end_date, is_active, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?)
                "#,
                params![
                    link.id.clone(),
                    link.lead_kind.as_str(),
                    link.lead_id.clone(),
                    link.organiser_kind.as_str(),
                    link.organiser_id.clone(),
                    day(link.start_date),
                    link.end_date.map(day),
                    timestamp(Utc::now()),
                ],
            )
            .await?;

            let change = HierarchyChange::ProvisionalLink {
                lead_kind: link.lead_kind,
                lead_id: link.lead_id.clone(),
            };
            triggers::dispatch(&tx, mode, &change).await
        }
        .await;

        let report = finish_tx!(tx, result)?;
        Ok((link, report))
    }

    /// End a provisional link. Same date semantics as [`Database::end_supervision_link`].
    pub async fn end_provisional_link(
        &mut self,
        link_id: &str,
        end_date: Option<NaiveDate>,
    ) -> Result<TriggerReport> {
        let mode = self.trigger_mode;
        let tx = self.conn.transaction().await?;
        let result: Result<TriggerReport> = async {
            let mut link = fetch_provisional_link(&tx, link_id)
                .await?
                .ok_or_else(|| DbError::LinkNotFound(link_id.to_string()))?;
            apply_end(&mut link.end_date, &mut link.is_active, link.start_date, end_date);
            link.validate()?;

            tx.execute(
                "UPDATE provisional_links SET end_date = ?, is_active = ? WHERE id = ?",
                params![link.end_date.map(day), link.is_active as i64, link_id],
            )
            .await?;
            info!("Ended provisional link {} ({}:{})", link_id, link.lead_kind, link.lead_id);

            let change = HierarchyChange::ProvisionalLink {
                lead_kind: link.lead_kind,
                lead_id: link.lead_id.clone(),
            };
            triggers::dispatch(&tx, mode, &change).await
        }
        .await;

        finish_tx!(tx, result)
    }

    /// Assign a live organiser to a patch.
    ///
    /// At most one open row exists per (organiser, patch); assigning an
    /// already-assigned patch returns the open row and fires nothing.
    pub async fn assign_organiser_patch(
        &mut self,
        organiser_id: &str,
        patch_id: &str,
    ) -> Result<(OrganiserPatchAssignment, TriggerReport)> {
        let mode = self.trigger_mode;
        let tx = self.conn.transaction().await?;
        let result: Result<(OrganiserPatchAssignment, TriggerReport)> = async {
            ensure_identity_exists(&tx, IdentityKind::Live, organiser_id).await?;
            ensure_patches_exist(&tx, &[patch_id.to_string()]).await?;

            let rows = tx
                .query(
                    r#"
                    SELECT id, organiser_id, patch_id, effective_from, effective_to
                    FROM organiser_patch_assignments
                    WHERE organiser_id = ? AND patch_id = ? AND effective_to IS NULL
                    LIMIT 1
                    "#,
                    params![organiser_id, patch_id],
                )
                .await?;
            if let Some(row) = first_row(rows).await? {
                let existing = parse_organiser_assignment_row(&row)?;
                debug!("{} already assigned to {}", organiser_id, patch_id);
                return Ok((existing, TriggerReport::default()));
            }

            let assignment = OrganiserPatchAssignment {
                id: uuid::Uuid::new_v4().to_string(),
                organiser_id: organiser_id.to_string(),
                patch_id: patch_id.to_string(),
                effective_from: Utc::now(),
                effective_to: None,
            };

            tx.execute(
                r#"
                INSERT INTO organiser_patch_assignments (id, organiser_id, patch_id, effective_from)
                VALUES (?, ?, ?, ?)
                "#,
                params![
                    assignment.id.clone(),
                    assignment.organiser_id.clone(),
                    assignment.patch_id.clone(),
                    timestamp(assignment.effective_from),
                ],
            )
            .await?;

            let change = HierarchyChange::FieldAssignment {
                organiser_id: organiser_id.to_string(),
            };
            let report = triggers::dispatch(&tx, mode, &change).await?;
            Ok((assignment, report))
        }
        .await;

        finish_tx!(tx, result)
    }

    /// End a live organiser's open assignment to a patch.
    ///
    /// Ending an assignment that is not open is a no-op.
    pub async fn end_organiser_patch(
        &mut self,
        organiser_id: &str,
        patch_id: &str,
    ) -> Result<TriggerReport> {
        let mode = self.trigger_mode;
        let tx = self.conn.transaction().await?;
        let result: Result<TriggerReport> = async {
            let closed = tx
                .execute(
                    r#"
                    UPDATE organiser_patch_assignments SET effective_to = ?
                    WHERE organiser_id = ? AND patch_id = ? AND effective_to IS NULL
                    "#,
                    params![timestamp(Utc::now()), organiser_id, patch_id],
                )
                .await?;
            if closed == 0 {
                debug!("{} has no open assignment to {}", organiser_id, patch_id);
                return Ok(TriggerReport::default());
            }

            let change = HierarchyChange::FieldAssignment {
                organiser_id: organiser_id.to_string(),
            };
            triggers::dispatch(&tx, mode, &change).await
        }
        .await;

        finish_tx!(tx, result)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Fetch a live user. Returns UserNotFound if the id is not in `users`.
    pub async fn get_user(&self, id: &str) -> Result<LiveUser> {
        fetch_live_user(&self.conn, id)
            .await?
            .ok_or_else(|| DbError::UserNotFound(id.to_string()))
    }

    /// Fetch a provisional user. Returns UserNotFound if absent.
    pub async fn get_pending_user(&self, id: &str) -> Result<PendingUser> {
        fetch_pending_user(&self.conn, id)
            .await?
            .ok_or_else(|| DbError::UserNotFound(id.to_string()))
    }

    pub async fn get_patch(&self, id: &str) -> Result<Patch> {
        let rows = self
            .conn
            .query("SELECT id, name, created_at FROM patches WHERE id = ?", params![id])
            .await?;

        if let Some(row) = first_row(rows).await? {
            parse_patch_row(&row)
        } else {
            Err(DbError::PatchNotFound(id.to_string()))
        }
    }

    pub async fn list_patches(&self) -> Result<Vec<Patch>> {
        let mut rows = self
            .conn
            .query("SELECT id, name, created_at FROM patches ORDER BY name ASC", params![])
            .await?;

        let mut patches = Vec::new();
        while let Some(row) = rows.next().await? {
            patches.push(parse_patch_row(&row)?);
        }

        Ok(patches)
    }

    /// List live users, optionally filtered to one role.
    pub async fn list_users(&self, role: Option<Role>) -> Result<Vec<LiveUser>> {
        let mut query = String::from(
            "SELECT id, email, full_name, role, is_active, created_at, updated_at FROM users",
        );
        let mut params_vec: Vec<turso::Value> = Vec::new();

        if let Some(role) = role {
            query.push_str(" WHERE role = ?");
            params_vec.push(role.as_str().to_string().into());
        }
        query.push_str(" ORDER BY id ASC");

        let mut rows = self.conn.query(&query, params_vec).await?;
        let mut users = Vec::new();

        while let Some(row) = rows.next().await? {
            users.push(parse_live_user_row(&row)?);
        }

        Ok(users)
    }

    /// All supervision links anchored at a live lead, active or not.
    pub async fn supervision_links_for_lead(&self, lead_id: &str) -> Result<Vec<SupervisionLink>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT id, lead_id, organiser_id, start_date, end_date, is_active
                FROM lead_organiser_links
                WHERE lead_id = ?
                ORDER BY start_date ASC, id ASC
                "#,
                params![lead_id],
            )
            .await?;

        let mut links = Vec::new();
        while let Some(row) = rows.next().await? {
            links.push(parse_supervision_row(&row)?);
        }

        Ok(links)
    }

    /// All provisional links anchored at a lead of the given kind.
    pub async fn provisional_links_for_lead(
        &self,
        lead_kind: IdentityKind,
        lead_id: &str,
    ) -> Result<Vec<ProvisionalLink>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT id, lead_kind, lead_id, organiser_kind, organiser_id,
                       start_date, end_date, is_active
                FROM provisional_links
                WHERE lead_kind = ? AND lead_id = ?
                ORDER BY start_date ASC, id ASC
                "#,
                params![lead_kind.as_str(), lead_id],
            )
            .await?;

        let mut links = Vec::new();
        while let Some(row) = rows.next().await? {
            links.push(parse_provisional_row(&row)?);
        }

        Ok(links)
    }

    /// Open field assignments of a live organiser.
    pub async fn active_organiser_patches(
        &self,
        organiser_id: &str,
    ) -> Result<Vec<OrganiserPatchAssignment>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT id, organiser_id, patch_id, effective_from, effective_to
                FROM organiser_patch_assignments
                WHERE organiser_id = ? AND effective_to IS NULL
                ORDER BY patch_id ASC
                "#,
                params![organiser_id],
            )
            .await?;

        let mut assignments = Vec::new();
        while let Some(row) = rows.next().await? {
            assignments.push(parse_organiser_assignment_row(&row)?);
        }

        Ok(assignments)
    }

    /// Open rows of the reconciled output table for one lead.
    pub async fn active_lead_patches(&self, lead_id: &str) -> Result<Vec<LeadPatchAssignment>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT id, lead_id, patch_id, effective_from, effective_to
                FROM lead_patch_assignments
                WHERE lead_id = ? AND effective_to IS NULL
                ORDER BY patch_id ASC, effective_from ASC
                "#,
                params![lead_id],
            )
            .await?;

        let mut assignments = Vec::new();
        while let Some(row) = rows.next().await? {
            assignments.push(parse_lead_assignment_row(&row)?);
        }

        Ok(assignments)
    }

    /// Every row ever written for one lead, open and closed, oldest first.
    pub async fn lead_patch_history(&self, lead_id: &str) -> Result<Vec<LeadPatchAssignment>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT id, lead_id, patch_id, effective_from, effective_to
                FROM lead_patch_assignments
                WHERE lead_id = ?
                ORDER BY effective_from ASC, id ASC
                "#,
                params![lead_id],
            )
            .await?;

        let mut assignments = Vec::new();
        while let Some(row) = rows.next().await? {
            assignments.push(parse_lead_assignment_row(&row)?);
        }

        Ok(assignments)
    }

    /// Number of open lead assignments across all leads.
    pub async fn count_active_lead_assignments(&self) -> Result<i64> {
        let rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM lead_patch_assignments WHERE effective_to IS NULL",
                params![],
            )
            .await?;

        if let Some(row) = first_row(rows).await? {
            Ok(row.get(0)?)
        } else {
            Ok(0)
        }
    }
}

// ----------------------------------------------------------------------
// Connection-level helpers. They take `&Connection` so callers can pass
// either the database connection or an open transaction.
// ----------------------------------------------------------------------

pub(crate) async fn fetch_live_user(conn: &Connection, id: &str) -> Result<Option<LiveUser>> {
    let rows = conn
        .query(
            r#"
            SELECT id, email, full_name, role, is_active, created_at, updated_at
            FROM users WHERE id = ?
            "#,
            params![id],
        )
        .await?;

    match first_row(rows).await? {
        Some(row) => Ok(Some(parse_live_user_row(&row)?)),
        None => Ok(None),
    }
}

pub(crate) async fn fetch_pending_user(conn: &Connection, id: &str) -> Result<Option<PendingUser>> {
    let rows = conn
        .query(
            r#"
            SELECT id, email, full_name, role, status, assigned_patch_ids,
                   created_at, updated_at
            FROM pending_users WHERE id = ?
            "#,
            params![id],
        )
        .await?;

    match first_row(rows).await? {
        Some(row) => Ok(Some(parse_pending_user_row(&row)?)),
        None => Ok(None),
    }
}

/// Whether `id` is a live user with the lead role and an active account.
pub(crate) async fn is_live_lead(conn: &Connection, id: &str) -> Result<bool> {
    let rows = conn
        .query(
            "SELECT 1 FROM users WHERE id = ? AND role = ? AND is_active = 1",
            params![id, Role::LeadOrganiser.as_str()],
        )
        .await?;

    Ok(first_row(rows).await?.is_some())
}

async fn fetch_supervision_link(conn: &Connection, id: &str) -> Result<Option<SupervisionLink>> {
    let rows = conn
        .query(
            r#"
            SELECT id, lead_id, organiser_id, start_date, end_date, is_active
            FROM lead_organiser_links WHERE id = ?
            "#,
            params![id],
        )
        .await?;

    match first_row(rows).await? {
        Some(row) => Ok(Some(parse_supervision_row(&row)?)),
        None => Ok(None),
    }
}

async fn fetch_provisional_link(conn: &Connection, id: &str) -> Result<Option<ProvisionalLink>> {
    let rows = conn
        .query(
            r#"
            SELECT id, lead_kind, lead_id, organiser_kind, organiser_id,
                   start_date, end_date, is_active
            FROM provisional_links WHERE id = ?
            "#,
            params![id],
        )
        .await?;

    match first_row(rows).await? {
        Some(row) => Ok(Some(parse_provisional_row(&row)?)),
        None => Ok(None),
    }
}

async fn ensure_identity_exists(conn: &Connection, kind: IdentityKind, id: &str) -> Result<()> {
    let query = match kind {
        IdentityKind::Live => "SELECT 1 FROM users WHERE id = ?",
        IdentityKind::Provisional => "SELECT 1 FROM pending_users WHERE id = ?",
    };

    let rows = conn.query(query, params![id]).await?;
    if first_row(rows).await?.is_none() {
        return Err(DbError::UserNotFound(format!("{}:{}", kind, id)));
    }

    Ok(())
}

async fn ensure_patches_exist(conn: &Connection, patch_ids: &[PatchId]) -> Result<()> {
    for patch_id in patch_ids {
        let rows = conn
            .query("SELECT 1 FROM patches WHERE id = ?", params![patch_id.clone()])
            .await?;
        if first_row(rows).await?.is_none() {
            return Err(DbError::PatchNotFound(patch_id.clone()));
        }
    }

    Ok(())
}

/// Drop duplicate patch ids, keeping first-seen order.
fn dedup_patch_ids(patch_ids: &[PatchId]) -> Vec<PatchId> {
    let mut seen = std::collections::HashSet::new();
    patch_ids
        .iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

fn apply_end(
    end: &mut Option<NaiveDate>,
    is_active: &mut bool,
    start_date: NaiveDate,
    requested: Option<NaiveDate>,
) {
    match requested {
        Some(date) => *end = Some(date),
        None => {
            *end = Some(Utc::now().date_naive().max(start_date));
            *is_active = false;
        }
    }
}

/// RFC 3339 with fixed microsecond precision so stored stamps sort as text.
pub(crate) fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// ISO-8601 calendar date as stored in link tables.
pub(crate) fn day(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub(crate) fn parse_timestamp(value: &str, field: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .map_err(|e| DbError::Other(format!("failed to parse {}: {}", field, e)))?
        .with_timezone(&Utc))
}

fn parse_day(value: &str, field: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| DbError::Other(format!("failed to parse {}: {}", field, e)))
}

/// Decode a `pending_users.assigned_patch_ids` column.
pub(crate) fn parse_patch_ids(json: &str) -> Result<Vec<PatchId>> {
    if json.is_empty() || json == "null" {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(json)?)
}

fn parse_live_user_row(row: &turso::Row) -> Result<LiveUser> {
    let role: String = row.get(3)?;
    let is_active: i64 = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;

    Ok(LiveUser {
        id: row.get(0)?,
        email: row.get(1)?,
        full_name: row.get(2)?,
        role: role.parse()?,
        is_active: is_active != 0,
        created_at: parse_timestamp(&created_at, "created_at")?,
        updated_at: parse_timestamp(&updated_at, "updated_at")?,
    })
}

fn parse_pending_user_row(row: &turso::Row) -> Result<PendingUser> {
    let role: String = row.get(3)?;
    let status: String = row.get(4)?;
    let patch_json: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;

    Ok(PendingUser {
        id: row.get(0)?,
        email: row.get(1)?,
        full_name: row.get(2)?,
        role: role.parse()?,
        status: status.parse::<ProvisionalStatus>()?,
        assigned_patch_ids: parse_patch_ids(&patch_json)?,
        created_at: parse_timestamp(&created_at, "created_at")?,
        updated_at: parse_timestamp(&updated_at, "updated_at")?,
    })
}

fn parse_patch_row(row: &turso::Row) -> Result<Patch> {
    let created_at: String = row.get(2)?;

    Ok(Patch {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: parse_timestamp(&created_at, "created_at")?,
    })
}

fn parse_supervision_row(row: &turso::Row) -> Result<SupervisionLink> {
    let start_date: String = row.get(3)?;
    let end_date: Option<String> = row.get(4)?;
    let is_active: i64 = row.get(5)?;

    Ok(SupervisionLink {
        id: row.get(0)?,
        lead_id: row.get(1)?,
        organiser_id: row.get(2)?,
        start_date: parse_day(&start_date, "start_date")?,
        end_date: end_date.map(|d| parse_day(&d, "end_date")).transpose()?,
        is_active: is_active != 0,
    })
}

fn parse_provisional_row(row: &turso::Row) -> Result<ProvisionalLink> {
    let lead_kind: String = row.get(1)?;
    let organiser_kind: String = row.get(3)?;
    let start_date: String = row.get(5)?;
    let end_date: Option<String> = row.get(6)?;
    let is_active: i64 = row.get(7)?;

    Ok(ProvisionalLink {
        id: row.get(0)?,
        lead_kind: lead_kind.parse()?,
        lead_id: row.get(2)?,
        organiser_kind: organiser_kind.parse()?,
        organiser_id: row.get(4)?,
        start_date: parse_day(&start_date, "start_date")?,
        end_date: end_date.map(|d| parse_day(&d, "end_date")).transpose()?,
        is_active: is_active != 0,
    })
}

fn parse_organiser_assignment_row(row: &turso::Row) -> Result<OrganiserPatchAssignment> {
    let effective_from: String = row.get(3)?;
    let effective_to: Option<String> = row.get(4)?;

    Ok(OrganiserPatchAssignment {
        id: row.get(0)?,
        organiser_id: row.get(1)?,
        patch_id: row.get(2)?,
        effective_from: parse_timestamp(&effective_from, "effective_from")?,
        effective_to: effective_to
            .map(|s| parse_timestamp(&s, "effective_to"))
            .transpose()?,
    })
}

fn parse_lead_assignment_row(row: &turso::Row) -> Result<LeadPatchAssignment> {
    let effective_from: String = row.get(3)?;
    let effective_to: Option<String> = row.get(4)?;

    Ok(LeadPatchAssignment {
        id: row.get(0)?,
        lead_id: row.get(1)?,
        patch_id: row.get(2)?,
        effective_from: parse_timestamp(&effective_from, "effective_from")?,
        effective_to: effective_to
            .map(|s| parse_timestamp(&s, "effective_to"))
            .transpose()?,
    })
}
