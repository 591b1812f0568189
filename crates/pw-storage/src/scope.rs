//! Closure calculator: the set of patches a coordinator owns today.
//!
//! Scope is a pure read over the hierarchy tables. An id resolves to
//! exactly one [`Identity`]; live rows win over stale pending rows, so the
//! live and provisional walks never both run for one id.
//!
//! Live lead walk:
//!   - live organisers via active `lead_organiser_links`, contributing
//!     their open field assignments
//!   - provisional organisers via active `provisional_links` anchored at the
//!     lead, contributing their direct patches
//!
//! Provisional lead walk:
//!   - the lead's own direct patches
//!   - live and provisional organisers via active `provisional_links`
//!     anchored at the provisional lead, contributing as above
//!
//! Anything that is not a lead organiser has an empty scope.

use chrono::{NaiveDate, Utc};
use pw_core::{Identity, IdentityKind, PatchId, PendingUser};
use std::collections::BTreeSet;
use tracing::debug;
use turso::{params, Connection};

use crate::db::{self, day, first_row, parse_patch_ids, Database, Result};

impl Database {
    /// Every patch currently in scope for `coordinator_id`.
    ///
    /// Unknown ids, non-leads, deactivated leads and archived provisional
    /// leads all yield an empty set.
    pub async fn compute_scope(&self, coordinator_id: &str) -> Result<BTreeSet<PatchId>> {
        let identity = resolve_identity(&self.conn, coordinator_id).await?;
        scope_for(&self.conn, &identity, Utc::now().date_naive()).await
    }

    /// Resolve an id against both user tables with live precedence.
    pub async fn resolve_identity(&self, id: &str) -> Result<Identity> {
        resolve_identity(&self.conn, id).await
    }
}

pub(crate) async fn resolve_identity(conn: &Connection, id: &str) -> Result<Identity> {
    if let Some(user) = db::fetch_live_user(conn, id).await? {
        return Ok(Identity::Live(user));
    }
    let pending = db::fetch_pending_user(conn, id).await?;
    Ok(Identity::resolve(None, pending))
}

pub(crate) async fn scope_for(
    conn: &Connection,
    identity: &Identity,
    today: NaiveDate,
) -> Result<BTreeSet<PatchId>> {
    if identity.coordinator().is_none() {
        return Ok(BTreeSet::new());
    }

    let scope = match identity {
        Identity::Live(user) => live_scope(conn, &user.id, today).await?,
        Identity::Provisional(pending) => provisional_scope(conn, pending, today).await?,
        Identity::Unknown => BTreeSet::new(),
    };

    debug!("Scope has {} patches on {}", scope.len(), today);
    Ok(scope)
}

async fn live_scope(conn: &Connection, lead_id: &str, today: NaiveDate) -> Result<BTreeSet<PatchId>> {
    let mut scope = BTreeSet::new();

    for organiser_id in supervised_live_organisers(conn, lead_id, today).await? {
        scope.extend(open_field_patches(conn, &organiser_id).await?);
    }

    let linked = provisional_link_organisers(conn, IdentityKind::Live, lead_id, today).await?;
    for (kind, organiser_id) in linked {
        if kind == IdentityKind::Provisional {
            scope.extend(direct_patches(conn, &organiser_id).await?);
        }
    }

    Ok(scope)
}

async fn provisional_scope(
    conn: &Connection,
    lead: &PendingUser,
    today: NaiveDate,
) -> Result<BTreeSet<PatchId>> {
    let mut scope: BTreeSet<PatchId> = lead.assigned_patch_ids.iter().cloned().collect();

    for (kind, organiser_id) in
        provisional_link_organisers(conn, IdentityKind::Provisional, &lead.id, today).await?
    {
        match kind {
            IdentityKind::Live => scope.extend(open_field_patches(conn, &organiser_id).await?),
            IdentityKind::Provisional => scope.extend(direct_patches(conn, &organiser_id).await?),
        }
    }

    Ok(scope)
}

/// Live organisers under a live lead through links active on `today`.
async fn supervised_live_organisers(
    conn: &Connection,
    lead_id: &str,
    today: NaiveDate,
) -> Result<BTreeSet<String>> {
    let today = day(today);
    let mut rows = conn
        .query(
            r#"
            SELECT organiser_id FROM lead_organiser_links
            WHERE lead_id = ? AND is_active = 1 AND start_date <= ?
              AND (end_date IS NULL OR end_date >= ?)
            "#,
            params![lead_id, today.clone(), today],
        )
        .await?;

    let mut organisers = BTreeSet::new();
    while let Some(row) = rows.next().await? {
        organisers.insert(row.get::<String>(0)?);
    }

    Ok(organisers)
}

/// Organiser ends of provisional links anchored at a lead, active on `today`.
async fn provisional_link_organisers(
    conn: &Connection,
    lead_kind: IdentityKind,
    lead_id: &str,
    today: NaiveDate,
) -> Result<Vec<(IdentityKind, String)>> {
    let today = day(today);
    let mut rows = conn
        .query(
            r#"
            SELECT organiser_kind, organiser_id FROM provisional_links
            WHERE lead_kind = ? AND lead_id = ? AND is_active = 1 AND start_date <= ?
              AND (end_date IS NULL OR end_date >= ?)
            "#,
            params![lead_kind.as_str(), lead_id, today.clone(), today],
        )
        .await?;

    let mut organisers = Vec::new();
    while let Some(row) = rows.next().await? {
        let kind: String = row.get(0)?;
        organisers.push((kind.parse::<IdentityKind>()?, row.get::<String>(1)?));
    }

    Ok(organisers)
}

async fn open_field_patches(conn: &Connection, organiser_id: &str) -> Result<Vec<PatchId>> {
    let mut rows = conn
        .query(
            r#"
            SELECT patch_id FROM organiser_patch_assignments
            WHERE organiser_id = ? AND effective_to IS NULL
            "#,
            params![organiser_id],
        )
        .await?;

    let mut patches = Vec::new();
    while let Some(row) = rows.next().await? {
        patches.push(row.get::<String>(0)?);
    }

    Ok(patches)
}

/// Direct patches of a provisional organiser; archived or missing rows give none.
async fn direct_patches(conn: &Connection, pending_id: &str) -> Result<Vec<PatchId>> {
    let rows = conn
        .query(
            "SELECT status, assigned_patch_ids FROM pending_users WHERE id = ?",
            params![pending_id],
        )
        .await?;

    let Some(row) = first_row(rows).await? else {
        return Ok(Vec::new());
    };

    let status: String = row.get(0)?;
    if status.parse::<pw_core::ProvisionalStatus>()?.is_archived() {
        return Ok(Vec::new());
    }

    let patch_json: String = row.get(1)?;
    parse_patch_ids(&patch_json)
}
