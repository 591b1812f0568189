//! Differ/applier for `lead_patch_assignments`.
//!
//! Reconciliation recomputes a lead's full scope, diffs it against the
//! open rows, closes rows that left scope and inserts rows for patches that
//! entered it. Rows are never deleted or reopened, so the table doubles as
//! the assignment history.

use chrono::{DateTime, Utc};
use pw_core::{Actor, PatchId, ReconcileOutcome, ReconcileSummary, Role, UserId};
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};
use turso::{params, Connection};

use crate::db::{self, finish_tx, timestamp, Database, DbError, Result};
use crate::queue;
use crate::scope;

impl Database {
    /// Bring one coordinator's open assignments in line with their scope.
    ///
    /// Provisional identities are computed but never written; the outcome
    /// is flagged `skipped_provisional`.
    pub async fn reconcile(&mut self, coordinator_id: &str) -> Result<ReconcileOutcome> {
        let tx = self.conn.transaction().await?;
        let result = reconcile_in(&tx, coordinator_id, Utc::now()).await;
        finish_tx!(tx, result)
    }

    /// Reconcile every live lead, one transaction each.
    ///
    /// A coordinator that fails is recorded in the summary and the sweep
    /// moves on. Requires [`Actor::System`] or an active admin.
    pub async fn reconcile_all(&mut self, actor: &Actor) -> Result<ReconcileSummary> {
        authorize(&self.conn, actor).await?;

        let targets = sweep_targets(&self.conn).await?;
        info!("Reconciling {} coordinators", targets.len());

        let mut summary = ReconcileSummary::default();
        for coordinator_id in targets {
            let tx = self.conn.transaction().await?;
            let result = reconcile_in(&tx, &coordinator_id, Utc::now()).await;
            let result: Result<ReconcileOutcome> = finish_tx!(tx, result);

            match result {
                Ok(outcome) => summary.record(&outcome),
                Err(e) => {
                    error!("Reconciliation failed for {}: {}", coordinator_id, e);
                    summary.record_failure(coordinator_id, e);
                }
            }
        }

        info!(
            "Reconciled {} coordinators: +{} -{} ({} failed)",
            summary.coordinators_processed,
            summary.total_added,
            summary.total_removed,
            summary.failures.len()
        );

        Ok(summary)
    }

    /// Queue one reconcile job per live lead for the worker pool.
    ///
    /// Same privilege gate as [`Database::reconcile_all`]. Returns the number
    /// of jobs inserted; leads that already have a pending job are skipped.
    pub async fn enqueue_sweep(&mut self, actor: &Actor) -> Result<usize> {
        authorize(&self.conn, actor).await?;

        let tx = self.conn.transaction().await?;
        let result: Result<usize> = async {
            let now = Utc::now();
            let mut inserted = 0;
            for coordinator_id in sweep_targets(&tx).await? {
                if queue::enqueue_in(&tx, &coordinator_id, "sweep", now)
                    .await?
                    .is_some()
                {
                    inserted += 1;
                }
            }
            Ok(inserted)
        }
        .await;

        let inserted = finish_tx!(tx, result)?;
        info!("Sweep enqueued {} reconcile jobs", inserted);
        Ok(inserted)
    }

    /// Ids of every active live lead organiser.
    pub async fn active_lead_ids(&self) -> Result<Vec<UserId>> {
        active_lead_ids(&self.conn).await
    }
}

/// Reconcile one coordinator on an open connection or transaction.
pub(crate) async fn reconcile_in(
    conn: &Connection,
    coordinator_id: &str,
    now: DateTime<Utc>,
) -> Result<ReconcileOutcome> {
    let identity = scope::resolve_identity(conn, coordinator_id).await?;
    if identity.is_provisional() {
        debug!("{} is provisional, nothing to persist", coordinator_id);
        return Ok(ReconcileOutcome {
            skipped_provisional: true,
            ..ReconcileOutcome::unchanged(coordinator_id)
        });
    }

    let computed = scope::scope_for(conn, &identity, now.date_naive()).await?;
    let stamp = timestamp(now);

    // patch -> open row, keeping the earliest row when drift left duplicates
    let mut open: BTreeMap<PatchId, String> = BTreeMap::new();
    for (row_id, patch_id) in open_rows(conn, coordinator_id).await? {
        if open.contains_key(&patch_id) {
            warn!(
                "Closing duplicate open assignment {} for {} on {}",
                row_id, coordinator_id, patch_id
            );
            close_row(conn, &row_id, &stamp).await?;
            continue;
        }
        open.insert(patch_id, row_id);
    }

    let mut outcome = ReconcileOutcome::unchanged(coordinator_id);

    for (patch_id, row_id) in &open {
        if !computed.contains(patch_id) {
            debug!("{} leaves scope of {}", patch_id, coordinator_id);
            close_row(conn, row_id, &stamp).await?;
            outcome.removed += 1;
        }
    }

    for patch_id in &computed {
        if !open.contains_key(patch_id) {
            debug!("{} enters scope of {}", patch_id, coordinator_id);
            conn.execute(
                r#"
                INSERT INTO lead_patch_assignments (id, lead_id, patch_id, effective_from)
                VALUES (?, ?, ?, ?)
                "#,
                params![
                    uuid::Uuid::new_v4().to_string(),
                    coordinator_id,
                    patch_id.clone(),
                    stamp.clone(),
                ],
            )
            .await?;
            outcome.added += 1;
        }
    }

    if !outcome.is_noop() {
        info!(
            "Reconciled {}: +{} -{}",
            coordinator_id, outcome.added, outcome.removed
        );
    }

    Ok(outcome)
}

/// Reject anyone but the system or an active live admin.
pub(crate) async fn authorize(conn: &Connection, actor: &Actor) -> Result<()> {
    let user_id = match actor {
        Actor::System => return Ok(()),
        Actor::User(id) => id,
    };

    match db::fetch_live_user(conn, user_id).await? {
        Some(user) if user.role == Role::Admin && user.is_active => Ok(()),
        Some(user) => Err(DbError::Unauthorized(format!(
            "{} ({}) may not run bulk reconciliation",
            user.id, user.role
        ))),
        None => Err(DbError::Unauthorized(format!("unknown user {}", user_id))),
    }
}

async fn active_lead_ids(conn: &Connection) -> Result<Vec<UserId>> {
    let mut rows = conn
        .query(
            "SELECT id FROM users WHERE role = ? AND is_active = 1 ORDER BY id ASC",
            params![Role::LeadOrganiser.as_str()],
        )
        .await?;

    let mut ids = Vec::new();
    while let Some(row) = rows.next().await? {
        ids.push(row.get::<String>(0)?);
    }

    Ok(ids)
}

/// Active leads plus anyone still holding open rows (demoted or
/// deactivated leads whose rows were never closed).
async fn sweep_targets(conn: &Connection) -> Result<Vec<String>> {
    let mut targets: std::collections::BTreeSet<String> =
        active_lead_ids(conn).await?.into_iter().collect();

    let mut rows = conn
        .query(
            "SELECT lead_id FROM lead_patch_assignments WHERE effective_to IS NULL",
            params![],
        )
        .await?;
    while let Some(row) = rows.next().await? {
        targets.insert(row.get::<String>(0)?);
    }

    Ok(targets.into_iter().collect())
}

/// (row id, patch id) of a lead's open rows, oldest first.
async fn open_rows(conn: &Connection, lead_id: &str) -> Result<Vec<(String, PatchId)>> {
    let mut rows = conn
        .query(
            r#"
            SELECT id, patch_id FROM lead_patch_assignments
            WHERE lead_id = ? AND effective_to IS NULL
            ORDER BY effective_from ASC, id ASC
            "#,
            params![lead_id],
        )
        .await?;

    let mut open = Vec::new();
    while let Some(row) = rows.next().await? {
        open.push((row.get::<String>(0)?, row.get::<String>(1)?));
    }

    Ok(open)
}

async fn close_row(conn: &Connection, row_id: &str, stamp: &str) -> Result<()> {
    conn.execute(
        "UPDATE lead_patch_assignments SET effective_to = ? WHERE id = ?",
        params![stamp, row_id],
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pw_core::{IdentityKind, LiveUser, Patch, PendingUser, ProvisionalStatus, TriggerMode};
    use tempfile::TempDir;

    async fn create_test_db() -> (Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(temp_dir.path().join("reconcile.db")).await.unwrap();
        db.init_schema().await.unwrap();
        (db, temp_dir)
    }

    fn live(id: &str, role: Role) -> LiveUser {
        LiveUser {
            id: id.to_string(),
            email: format!("{}@example.org", id),
            full_name: None,
            role,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn seed_patch(db: &Database, id: &str) {
        db.upsert_patch(&Patch {
            id: id.to_string(),
            name: id.to_uppercase(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_open_rows_are_healed() {
        let (mut db, _dir) = create_test_db().await;
        seed_patch(&db, "p1").await;
        let today = Utc::now().date_naive();

        db.upsert_user(&live("lead", Role::LeadOrganiser)).await.unwrap();
        db.upsert_user(&live("org", Role::Organiser)).await.unwrap();
        db.add_supervision_link("lead", "org", today, None).await.unwrap();
        db.assign_organiser_patch("org", "p1").await.unwrap();
        db.reconcile("lead").await.unwrap();

        // simulate a bulk load that bypassed the reconciler
        db.conn
            .execute(
                r#"
                INSERT INTO lead_patch_assignments (id, lead_id, patch_id, effective_from)
                VALUES ('dup-row', 'lead', 'p1', '2999-01-01T00:00:00.000000Z')
                "#,
                params![],
            )
            .await
            .unwrap();
        assert_eq!(db.active_lead_patches("lead").await.unwrap().len(), 2);

        let outcome = db.reconcile("lead").await.unwrap();
        assert!(outcome.is_noop());

        let active = db.active_lead_patches("lead").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_ne!(active[0].id, "dup-row", "the earliest row survives");
    }

    #[tokio::test]
    async fn test_sweep_isolates_failing_coordinator() {
        // queued so the setup writes leave the output table untouched
        let (db, _dir) = create_test_db().await;
        let mut db = db.with_trigger_mode(TriggerMode::Queued);
        seed_patch(&db, "p1").await;
        seed_patch(&db, "p2").await;
        let today = Utc::now().date_naive();

        for id in ["lead-a", "lead-b"] {
            db.upsert_user(&live(id, Role::LeadOrganiser)).await.unwrap();
        }
        db.upsert_user(&live("org", Role::Organiser)).await.unwrap();
        db.add_supervision_link("lead-b", "org", today, None).await.unwrap();
        db.assign_organiser_patch("org", "p2").await.unwrap();

        db.upsert_pending_user(&PendingUser {
            id: "pend".to_string(),
            email: "pend@example.org".to_string(),
            full_name: None,
            role: Role::Organiser,
            status: ProvisionalStatus::Invited,
            assigned_patch_ids: vec!["p1".to_string()],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();
        db.add_provisional_link(
            IdentityKind::Live,
            "lead-a",
            IdentityKind::Provisional,
            "pend",
            today,
            None,
        )
        .await
        .unwrap();

        db.conn
            .execute(
                "UPDATE pending_users SET assigned_patch_ids = '{broken' WHERE id = 'pend'",
                params![],
            )
            .await
            .unwrap();

        let summary = db.reconcile_all(&Actor::System).await.unwrap();
        assert_eq!(summary.coordinators_processed, 1);
        assert_eq!(summary.total_added, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].coordinator_id, "lead-a");

        assert_eq!(db.active_lead_patches("lead-b").await.unwrap().len(), 1);
        assert!(db.active_lead_patches("lead-a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_authorization_gate() {
        let (mut db, _dir) = create_test_db().await;
        db.upsert_user(&live("root", Role::Admin)).await.unwrap();
        db.upsert_user(&live("lead", Role::LeadOrganiser)).await.unwrap();
        let mut retired = live("retired", Role::Admin);
        retired.is_active = false;
        db.upsert_user(&retired).await.unwrap();
        db.upsert_user(&live("system", Role::Organiser)).await.unwrap();

        assert!(db.reconcile_all(&Actor::User("root".to_string())).await.is_ok());
        assert!(db.enqueue_sweep(&Actor::System).await.is_ok());

        // a user who happens to be called "system" is still just a user
        for who in ["lead", "retired", "stranger", "system"] {
            let err = db
                .reconcile_all(&Actor::user(who))
                .await
                .unwrap_err();
            assert!(matches!(err, DbError::Unauthorized(_)), "{} passed the gate", who);

            let err = db
                .enqueue_sweep(&Actor::user(who))
                .await
                .unwrap_err();
            assert!(matches!(err, DbError::Unauthorized(_)));
        }
    }
}
