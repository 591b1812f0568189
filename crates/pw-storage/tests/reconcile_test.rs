//! Integration tests for the reconciliation engine
//!
//! Tests the full path from hierarchy writes to `lead_patch_assignments`:
//! - Scope computation for live and provisional leads
//! - Idempotent, history-preserving reconciliation
//! - Inline and queued triggers converging on the same state
//! - Bulk reconciliation authorization

use chrono::Utc;
use pw_core::{
    Actor, IdentityKind, LiveUser, Patch, PendingUser, ProvisionalStatus, Role, TriggerMode,
};
use pw_storage::{Database, DbError};
use std::collections::BTreeSet;
use tempfile::TempDir;

/// Helper to create a temporary database for testing
async fn create_test_db(mode: TriggerMode) -> (Database, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db = Database::open(temp_dir.path().join("patchwork.db"))
        .await
        .expect("Failed to open database")
        .with_trigger_mode(mode);
    db.init_schema().await.expect("Failed to init schema");
    (db, temp_dir)
}

fn create_user(id: &str, role: Role) -> LiveUser {
    LiveUser {
        id: id.to_string(),
        email: format!("{}@example.org", id),
        full_name: Some(format!("User {}", id)),
        role,
        is_active: true,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn create_pending(id: &str, role: Role, patches: &[&str]) -> PendingUser {
    PendingUser {
        id: id.to_string(),
        email: format!("{}@example.org", id),
        full_name: None,
        role,
        status: ProvisionalStatus::Invited,
        assigned_patch_ids: patches.iter().map(|p| p.to_string()).collect(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

async fn create_patches(db: &Database, ids: &[&str]) {
    for id in ids {
        db.upsert_patch(&Patch {
            id: id.to_string(),
            name: format!("Patch {}", id),
            created_at: Utc::now(),
        })
        .await
        .expect("Failed to upsert patch");
    }
}

fn set_of(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

async fn active_set(db: &Database, lead_id: &str) -> BTreeSet<String> {
    db.active_lead_patches(lead_id)
        .await
        .expect("Failed to read active rows")
        .into_iter()
        .map(|row| row.patch_id)
        .collect()
}

/// Claim and apply queued jobs until none are runnable.
async fn drain(db: &mut Database) {
    loop {
        let jobs = db.claim_jobs(16).await.expect("Failed to claim jobs");
        if jobs.is_empty() {
            break;
        }
        for job in jobs {
            db.reconcile(&job.coordinator_id)
                .await
                .expect("Failed to reconcile job");
            db.complete_job(&job.id).await.expect("Failed to complete job");
        }
    }
}

/// Lead L supervising live organiser O, who holds P1 and P2.
async fn seed_lead_with_organiser(db: &mut Database) {
    let today = Utc::now().date_naive();
    create_patches(db, &["P1", "P2"]).await;
    db.upsert_user(&create_user("L", Role::LeadOrganiser))
        .await
        .expect("Failed to create lead");
    db.upsert_user(&create_user("O", Role::Organiser))
        .await
        .expect("Failed to create organiser");
    db.add_supervision_link("L", "O", today, None)
        .await
        .expect("Failed to link");
    db.assign_organiser_patch("O", "P1").await.expect("Failed to assign P1");
    db.assign_organiser_patch("O", "P2").await.expect("Failed to assign P2");
}

#[tokio::test]
async fn test_lead_gains_organiser_patches() {
    let (mut db, _dir) = create_test_db(TriggerMode::Queued).await;
    seed_lead_with_organiser(&mut db).await;

    let outcome = db.reconcile("L").await.expect("Failed to reconcile");
    assert_eq!(outcome.added, 2);
    assert_eq!(outcome.removed, 0);
    assert_eq!(active_set(&db, "L").await, set_of(&["P1", "P2"]));
}

#[tokio::test]
async fn test_ended_assignment_closes_lead_row() {
    let (mut db, _dir) = create_test_db(TriggerMode::Inline).await;
    seed_lead_with_organiser(&mut db).await;
    assert_eq!(active_set(&db, "L").await, set_of(&["P1", "P2"]));

    let report = db
        .end_organiser_patch("O", "P2")
        .await
        .expect("Failed to end assignment");
    assert_eq!(report.affected, vec!["L".to_string()]);
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].added, 0);
    assert_eq!(report.outcomes[0].removed, 1);

    assert_eq!(active_set(&db, "L").await, set_of(&["P1"]));

    // the P2 row is closed, not deleted
    let history = db.lead_patch_history("L").await.expect("Failed to read history");
    let p2: Vec<_> = history.iter().filter(|row| row.patch_id == "P2").collect();
    assert_eq!(p2.len(), 1);
    assert!(p2[0].effective_to.is_some());
}

#[tokio::test]
async fn test_default_mode_applies_writes_synchronously() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut db = Database::open(temp_dir.path().join("patchwork.db"))
        .await
        .expect("Failed to open database");
    db.init_schema().await.expect("Failed to init schema");
    assert_eq!(db.trigger_mode(), TriggerMode::Inline);

    seed_lead_with_organiser(&mut db).await;
    assert_eq!(active_set(&db, "L").await, set_of(&["P1", "P2"]));

    db.end_organiser_patch("O", "P2")
        .await
        .expect("Failed to end assignment");
    assert_eq!(active_set(&db, "L").await, set_of(&["P1"]));
    assert_eq!(db.job_counts().await.expect("Failed to count jobs").total(), 0);
}

#[tokio::test]
async fn test_provisional_lead_scope_is_computed_not_persisted() {
    let (mut db, _dir) = create_test_db(TriggerMode::Inline).await;
    let today = Utc::now().date_naive();
    create_patches(&db, &["P3", "P4"]).await;

    db.upsert_pending_user(&create_pending("DL", Role::LeadOrganiser, &["P3"]))
        .await
        .expect("Failed to create provisional lead");
    db.upsert_pending_user(&create_pending("DO", Role::Organiser, &["P4"]))
        .await
        .expect("Failed to create provisional organiser");
    let (_, report) = db
        .add_provisional_link(
            IdentityKind::Provisional,
            "DL",
            IdentityKind::Provisional,
            "DO",
            today,
            None,
        )
        .await
        .expect("Failed to link");
    assert!(report.affected.is_empty());

    assert_eq!(
        db.compute_scope("DL").await.expect("Failed to compute scope"),
        set_of(&["P3", "P4"])
    );

    let outcome = db.reconcile("DL").await.expect("Failed to reconcile");
    assert!(outcome.skipped_provisional);
    assert!(outcome.is_noop());
    assert!(db.lead_patch_history("DL").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_provisional_lead_reaches_live_organiser() {
    let (mut db, _dir) = create_test_db(TriggerMode::Queued).await;
    let today = Utc::now().date_naive();
    create_patches(&db, &["P1", "P3"]).await;

    db.upsert_pending_user(&create_pending("DL", Role::LeadOrganiser, &["P3"]))
        .await
        .unwrap();
    db.upsert_user(&create_user("O", Role::Organiser)).await.unwrap();
    db.assign_organiser_patch("O", "P1").await.unwrap();
    db.add_provisional_link(
        IdentityKind::Provisional,
        "DL",
        IdentityKind::Live,
        "O",
        today,
        None,
    )
    .await
    .unwrap();

    assert_eq!(db.compute_scope("DL").await.unwrap(), set_of(&["P1", "P3"]));
}

#[tokio::test]
async fn test_lead_without_organisers_loses_all_rows() {
    let (mut db, _dir) = create_test_db(TriggerMode::Inline).await;
    seed_lead_with_organiser(&mut db).await;
    assert_eq!(active_set(&db, "L").await.len(), 2);

    let link = db.supervision_links_for_lead("L").await.unwrap().remove(0);
    let report = db
        .end_supervision_link(&link.id, None)
        .await
        .expect("Failed to end link");
    assert_eq!(report.total_removed(), 2);

    assert!(db.compute_scope("L").await.unwrap().is_empty());
    assert!(active_set(&db, "L").await.is_empty());
    assert_eq!(db.lead_patch_history("L").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_sequential_edits_both_reflected() {
    for mode in [TriggerMode::Inline, TriggerMode::Queued] {
        let (mut db, _dir) = create_test_db(mode).await;
        let today = Utc::now().date_naive();
        create_patches(&db, &["P1", "P2", "P3"]).await;

        db.upsert_user(&create_user("L", Role::LeadOrganiser)).await.unwrap();
        for org in ["O1", "O2"] {
            db.upsert_user(&create_user(org, Role::Organiser)).await.unwrap();
            db.add_supervision_link("L", org, today, None).await.unwrap();
        }
        db.assign_organiser_patch("O1", "P1").await.unwrap();
        db.assign_organiser_patch("O1", "P3").await.unwrap();
        db.assign_organiser_patch("O2", "P2").await.unwrap();
        drain(&mut db).await;
        assert_eq!(active_set(&db, "L").await, set_of(&["P1", "P2", "P3"]));

        db.end_organiser_patch("O1", "P1").await.unwrap();
        db.end_organiser_patch("O2", "P2").await.unwrap();
        drain(&mut db).await;

        assert_eq!(active_set(&db, "L").await, set_of(&["P3"]), "mode {}", mode);
    }
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let (mut db, _dir) = create_test_db(TriggerMode::Queued).await;
    seed_lead_with_organiser(&mut db).await;

    db.reconcile("L").await.unwrap();
    let before = db.active_lead_patches("L").await.unwrap();

    let outcome = db.reconcile("L").await.unwrap();
    assert_eq!(outcome.added, 0);
    assert_eq!(outcome.removed, 0);
    assert_eq!(db.active_lead_patches("L").await.unwrap(), before);
}

#[tokio::test]
async fn test_active_rows_match_computed_scope() {
    let (mut db, _dir) = create_test_db(TriggerMode::Queued).await;
    let today = Utc::now().date_naive();
    seed_lead_with_organiser(&mut db).await;
    create_patches(&db, &["P5"]).await;

    db.upsert_pending_user(&create_pending("DO", Role::Organiser, &["P2", "P5"]))
        .await
        .unwrap();
    db.add_provisional_link(
        IdentityKind::Live,
        "L",
        IdentityKind::Provisional,
        "DO",
        today,
        None,
    )
    .await
    .unwrap();
    db.reconcile("L").await.unwrap();

    let scope = db.compute_scope("L").await.unwrap();
    assert_eq!(scope, set_of(&["P1", "P2", "P5"]));
    assert_eq!(active_set(&db, "L").await, scope);

    // one open row per (lead, patch)
    let active = db.active_lead_patches("L").await.unwrap();
    assert_eq!(active.len(), scope.len());
}

#[tokio::test]
async fn test_readded_patch_gets_a_new_row() {
    let (mut db, _dir) = create_test_db(TriggerMode::Inline).await;
    seed_lead_with_organiser(&mut db).await;

    db.end_organiser_patch("O", "P1").await.unwrap();
    db.assign_organiser_patch("O", "P1").await.unwrap();

    let p1_rows: Vec<_> = db
        .lead_patch_history("L")
        .await
        .unwrap()
        .into_iter()
        .filter(|row| row.patch_id == "P1")
        .collect();
    assert_eq!(p1_rows.len(), 2);
    assert_ne!(p1_rows[0].id, p1_rows[1].id);
    assert!(p1_rows[0].effective_to.is_some());
    assert!(p1_rows[1].effective_to.is_none());
}

#[tokio::test]
async fn test_direct_patch_change_reaches_live_lead() {
    let (mut db, _dir) = create_test_db(TriggerMode::Inline).await;
    let today = Utc::now().date_naive();
    create_patches(&db, &["P1", "P2"]).await;

    db.upsert_user(&create_user("L", Role::LeadOrganiser)).await.unwrap();
    db.upsert_pending_user(&create_pending("DO", Role::Organiser, &["P1"]))
        .await
        .unwrap();
    db.add_provisional_link(
        IdentityKind::Live,
        "L",
        IdentityKind::Provisional,
        "DO",
        today,
        None,
    )
    .await
    .unwrap();
    assert_eq!(active_set(&db, "L").await, set_of(&["P1"]));

    let report = db
        .set_direct_patches("DO", &["P2".to_string()])
        .await
        .unwrap();
    assert_eq!(report.affected, vec!["L".to_string()]);
    assert_eq!(active_set(&db, "L").await, set_of(&["P2"]));
}

#[tokio::test]
async fn test_queued_mode_converges_with_inline() {
    let (mut queued, _q) = create_test_db(TriggerMode::Queued).await;
    let (mut inline, _i) = create_test_db(TriggerMode::Inline).await;

    for db in [&mut queued, &mut inline] {
        seed_lead_with_organiser(db).await;
        db.end_organiser_patch("O", "P1").await.unwrap();
    }

    assert!(active_set(&queued, "L").await.is_empty(), "nothing applied before drain");
    let counts = queued.job_counts().await.unwrap();
    assert_eq!(counts.pending, 1);

    drain(&mut queued).await;
    assert_eq!(active_set(&queued, "L").await, active_set(&inline, "L").await);
    assert_eq!(queued.job_counts().await.unwrap().done, 1);
}

#[tokio::test]
async fn test_bulk_reconcile_requires_admin() {
    let (mut db, _dir) = create_test_db(TriggerMode::Queued).await;
    seed_lead_with_organiser(&mut db).await;
    db.upsert_user(&create_user("A", Role::Admin)).await.unwrap();

    let err = db
        .reconcile_all(&Actor::User("O".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Unauthorized(_)));
    assert!(active_set(&db, "L").await.is_empty());

    let summary = db
        .reconcile_all(&Actor::User("A".to_string()))
        .await
        .expect("Admin should be allowed");
    assert_eq!(summary.coordinators_processed, 1);
    assert_eq!(summary.total_added, 2);
    assert!(!summary.has_errors());

    let again = db.reconcile_all(&Actor::System).await.unwrap();
    assert_eq!(again.total_added, 0);
    assert_eq!(again.total_removed, 0);
}

#[tokio::test]
async fn test_deactivated_lead_is_swept_clean() {
    let (mut db, _dir) = create_test_db(TriggerMode::Queued).await;
    seed_lead_with_organiser(&mut db).await;
    db.reconcile("L").await.unwrap();

    let mut inactive = create_user("L", Role::LeadOrganiser);
    inactive.is_active = false;
    let report = db.upsert_user(&inactive).await.unwrap();
    assert_eq!(report.affected, vec!["L".to_string()]);

    let summary = db.reconcile_all(&Actor::System).await.unwrap();
    assert_eq!(summary.total_removed, 2);
    assert!(active_set(&db, "L").await.is_empty());
}
