//! Four-stage identity resolution.
//!
//! 1. Exact key match on email/phone attributes.
//! 2. Fuzzy name match (normalisation + Levenshtein ratio + nickname table).
//! 3. Graph disambiguation against the message's co-occurring entities.
//! 4. Model-assisted arbitration — deferred to the background worker so the
//!    ingestion fast path never blocks on a remote call. Until arbitration
//!    lands, the probe is quarantined and a fresh entity stands in for it:
//!    conservative, auditable, reversible via the merge log.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use engram_extract::{ArbiterVerdict, CandidateSummary, IdentityArbiter, ProbeSummary};
use engram_store::error::{EngramError, Result};
use engram_store::rows;
use engram_store::types::{AttributeKind, Entity, EntityKind, PendingProbe, ts_to_sql};
use engram_store::Database;

use crate::entity;
use crate::graph;
use crate::nicknames::name_similarity;

/// Fuzzy score at or above which a candidate is accepted outright.
const HIGH_THRESHOLD: f64 = 0.93;
/// Fuzzy score below which a candidate is not even considered.
const AMBIGUOUS_FLOOR: f64 = 0.75;
/// Minimum edge strength for a neighbour to count in stage 3.
const NEIGHBOUR_STRENGTH_FLOOR: f64 = 0.3;
/// Shared neighbours required for a stage-3 win.
const SHARED_NEIGHBOUR_QUORUM: usize = 2;

/// A reference to a person or organisation as it appeared in a source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Probe {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub alias: Option<String>,
    /// Kind the probe should resolve against; defaults to person.
    #[serde(default = "default_probe_kind")]
    pub kind: EntityKind,
}

fn default_probe_kind() -> EntityKind {
    EntityKind::Person
}

impl Probe {
    pub fn person(name: Option<&str>, email: Option<&str>, phone: Option<&str>) -> Self {
        Self {
            name: name.map(str::to_string),
            email: email.map(str::to_string),
            phone: phone.map(str::to_string),
            alias: None,
            kind: EntityKind::Person,
        }
    }

    pub fn named(name: &str, kind: EntityKind) -> Self {
        Self {
            name: Some(name.to_string()),
            email: None,
            phone: None,
            alias: None,
            kind,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.email.is_none() && self.phone.is_none() && self.alias.is_none()
    }

    /// Best display name available: name, alias, email local part, phone.
    pub fn display_name(&self) -> Option<String> {
        if let Some(name) = self.name.as_deref().filter(|n| !n.trim().is_empty()) {
            return Some(name.trim().to_string());
        }
        if let Some(alias) = self.alias.as_deref().filter(|a| !a.trim().is_empty()) {
            return Some(alias.trim().to_string());
        }
        if let Some(email) = self.email.as_deref() {
            let local = email.split('@').next().unwrap_or(email);
            if !local.is_empty() {
                return Some(local.to_string());
            }
        }
        self.phone.clone()
    }

}

/// Outcome of one resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub entity_id: Uuid,
    /// A fresh entity was created for the probe.
    pub created: bool,
    /// The probe collapsed into an existing entity through a fuzzy stage.
    pub merged: bool,
    /// The probe was parked for background arbitration.
    pub quarantined: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct IdentityResolver {
    high_threshold: f64,
    ambiguous_floor: f64,
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self {
            high_threshold: HIGH_THRESHOLD,
            ambiguous_floor: AMBIGUOUS_FLOOR,
        }
    }
}

impl IdentityResolver {
    /// Resolve `probe` to an entity id, creating one for novel contacts.
    /// `co_occurring` holds the already-resolved participants of the message
    /// being ingested; stage 3 compares candidate neighbourhoods against it.
    pub fn resolve(
        &self,
        conn: &Connection,
        probe: &Probe,
        co_occurring: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<Resolved> {
        if probe.is_empty() {
            return Err(EngramError::InputInvalid("empty resolver probe".into()));
        }

        // Stage 1 — exact key match.
        for (kind, value) in [
            (AttributeKind::Email, probe.email.as_deref()),
            (AttributeKind::Phone, probe.phone.as_deref()),
        ] {
            let Some(value) = value else { continue };
            if let Some(hit) = entity::find_by_attribute(conn, &kind, value)? {
                debug!(probe = ?probe.display_name(), entity = %hit.id, key = kind.as_str(), "exact key hit");
                let _ = self.attach_probe(conn, &hit, probe)?;
                return Ok(Resolved {
                    entity_id: hit.id,
                    created: false,
                    merged: false,
                    quarantined: false,
                });
            }
        }

        // Stage 2 — fuzzy name match.
        let display_name = probe.display_name();
        let candidates: Vec<(Entity, f64)> = match display_name.as_deref() {
            Some(name) => self.fuzzy_candidates(conn, name, probe.kind)?,
            None => Vec::new(),
        };

        let strong_count = candidates
            .iter()
            .filter(|(_, score)| *score >= self.high_threshold)
            .count();
        if strong_count == 1 {
            let (hit, score) = candidates
                .iter()
                .find(|(_, score)| *score >= self.high_threshold)
                .expect("counted above");
            debug!(probe = ?display_name, entity = %hit.id, score, "fuzzy name hit");
            let attached = self.attach_probe(conn, hit, probe)?;
            return Ok(Resolved {
                entity_id: hit.id,
                created: false,
                merged: attached,
                quarantined: false,
            });
        }

        // Stage 3 — graph disambiguation among the ambiguous band.
        let ambiguous: Vec<(Entity, f64)> = candidates
            .into_iter()
            .filter(|(_, score)| *score >= self.ambiguous_floor)
            .collect();
        if !ambiguous.is_empty() && !co_occurring.is_empty() {
            let mut winners: Vec<(&Entity, f64, usize)> = Vec::new();
            for (candidate, score) in &ambiguous {
                let shared =
                    graph::shared_neighbours(conn, candidate.id, co_occurring, NEIGHBOUR_STRENGTH_FLOOR)?;
                if shared >= SHARED_NEIGHBOUR_QUORUM {
                    winners.push((candidate, *score, shared));
                }
            }
            if winners.len() == 1 {
                let (hit, score, shared) = winners[0];
                debug!(probe = ?display_name, entity = %hit.id, score, shared, "graph disambiguation hit");
                let attached = self.attach_probe(conn, hit, probe)?;
                return Ok(Resolved {
                    entity_id: hit.id,
                    created: false,
                    merged: attached,
                    quarantined: false,
                });
            }
        }

        // Stage 4 — quarantine for background arbitration when candidates
        // exist but none can be committed to; otherwise this is simply a new
        // contact.
        let name = display_name.ok_or_else(|| {
            EngramError::InputInvalid("probe has no name, alias, email, or phone".into())
        })?;
        let created = entity::create_entity(conn, &name, probe.kind, now)?;
        self.attach_probe(conn, &created, probe)?;

        if ambiguous.is_empty() {
            return Ok(Resolved {
                entity_id: created.id,
                created: true,
                merged: false,
                quarantined: false,
            });
        }

        let candidate_ids: Vec<Uuid> = ambiguous.iter().map(|(e, _)| e.id).collect();
        quarantine_probe(conn, probe, created.id, &candidate_ids, co_occurring, now)?;
        warn!(
            probe = %name,
            stand_in = %created.id,
            candidates = candidate_ids.len(),
            "probe quarantined pending arbitration"
        );
        Ok(Resolved {
            entity_id: created.id,
            created: true,
            merged: false,
            quarantined: true,
        })
    }

    fn fuzzy_candidates(
        &self,
        conn: &Connection,
        name: &str,
        kind: EntityKind,
    ) -> Result<Vec<(Entity, f64)>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM entities WHERE retired = 0 AND kind = ?1",
            rows::ENTITY_COLS
        ))?;
        let live = stmt
            .query_map([kind.as_str()], rows::entity_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut scored = Vec::new();
        for candidate in live {
            let mut best = name_similarity(name, &candidate.canonical_name);
            for attr in entity::attributes_of(conn, candidate.id)? {
                if attr.kind == AttributeKind::Alias {
                    best = best.max(name_similarity(name, &attr.value));
                }
            }
            if best >= self.ambiguous_floor {
                scored.push((candidate, best));
            }
        }
        scored.sort_by(|(_, a), (_, b)| b.total_cmp(a));
        Ok(scored)
    }

    /// Record the probe's keys on the matched entity. Returns whether any new
    /// attribute row was written (i.e. the probe brought novel evidence).
    fn attach_probe(&self, conn: &Connection, target: &Entity, probe: &Probe) -> Result<bool> {
        let mut added = false;
        if let Some(email) = probe.email.as_deref() {
            added |= entity::add_attribute(conn, target.id, &AttributeKind::Email, email, 0.95, None)?;
        }
        if let Some(phone) = probe.phone.as_deref() {
            added |= entity::add_attribute(conn, target.id, &AttributeKind::Phone, phone, 0.95, None)?;
        }
        if let Some(alias) = probe.alias.as_deref() {
            added |= entity::add_attribute(conn, target.id, &AttributeKind::Alias, alias, 0.8, None)?;
        }
        if let Some(name) = probe.name.as_deref() {
            if !name.trim().is_empty() && name.trim() != target.canonical_name {
                added |= entity::add_attribute(conn, target.id, &AttributeKind::Alias, name, 0.8, None)?;
            }
        }
        Ok(added)
    }
}

fn quarantine_probe(
    conn: &Connection,
    probe: &Probe,
    stand_in: Uuid,
    candidate_ids: &[Uuid],
    co_occurring: &[Uuid],
    now: DateTime<Utc>,
) -> Result<()> {
    let context = json!({
        "stand_in_entity_id": stand_in,
        "candidate_ids": candidate_ids,
        "co_occurring": co_occurring,
    });
    conn.execute(
        "INSERT INTO pending_probes (id, name, email, phone, alias, context, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            Uuid::new_v4().to_string(),
            probe.name,
            probe.email,
            probe.phone,
            probe.alias,
            context.to_string(),
            ts_to_sql(now),
        ],
    )?;
    Ok(())
}

pub fn pending_probes(conn: &Connection) -> Result<Vec<PendingProbe>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM pending_probes ORDER BY created_at",
        rows::PROBE_COLS
    ))?;
    let probes = stmt
        .query_map([], rows::probe_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(probes)
}

/// Background arbitration over the quarantine table (resolver stage 4).
///
/// A `Match` verdict folds the quarantine-time stand-in entity into the
/// matched one; `NewEntity` confirms the stand-in; `Inconclusive` (or a
/// deadline expiry) leaves the probe parked for a later cycle. Returns the
/// number of probes settled.
pub async fn arbitrate_pending(
    db: &Database,
    arbiter: &dyn IdentityArbiter,
    deadline: std::time::Duration,
) -> Result<usize> {
    let probes = db.with_conn(pending_probes)?;
    let mut settled = 0usize;

    for pending in probes {
        let stand_in: Option<Uuid> = pending
            .context
            .get("stand_in_entity_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok());
        let candidate_ids: Vec<Uuid> = pending
            .context
            .get("candidate_ids")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let co_occurring: Vec<Uuid> = pending
            .context
            .get("co_occurring")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let candidates = db.with_conn(|conn| {
            let mut summaries = Vec::new();
            for id in &candidate_ids {
                let Ok(candidate) = entity::get_live_entity(conn, *id) else {
                    continue;
                };
                let shared =
                    graph::shared_neighbours(conn, *id, &co_occurring, NEIGHBOUR_STRENGTH_FLOOR)?;
                summaries.push(CandidateSummary {
                    entity_id: *id,
                    canonical_name: candidate.canonical_name,
                    shared_neighbours: shared,
                });
            }
            Ok(summaries)
        })?;

        let summary = ProbeSummary {
            name: pending.name.clone(),
            email: pending.email.clone(),
            phone: pending.phone.clone(),
            alias: pending.alias.clone(),
        };
        let verdict = match tokio::time::timeout(deadline, arbiter.arbitrate(&summary, &candidates))
            .await
        {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(err)) => {
                warn!(probe = %pending.id, ?err, "arbiter failed — probe stays quarantined");
                continue;
            }
            Err(_) => {
                warn!(probe = %pending.id, "arbiter deadline expired — probe stays quarantined");
                continue;
            }
        };

        match verdict {
            ArbiterVerdict::Match(target) => {
                let Some(stand_in) = stand_in else { continue };
                if stand_in != target {
                    db.with_tx(|tx| {
                        entity::merge_entities(tx, target, stand_in, Utc::now())?;
                        tx.execute("DELETE FROM pending_probes WHERE id = ?1", [pending.id.to_string()])?;
                        Ok(())
                    })?;
                    info!(probe = %pending.id, %target, %stand_in, "arbitration matched — stand-in merged");
                }
                settled += 1;
            }
            ArbiterVerdict::NewEntity => {
                db.with_conn(|conn| {
                    conn.execute("DELETE FROM pending_probes WHERE id = ?1", [pending.id.to_string()])?;
                    Ok(())
                })?;
                debug!(probe = %pending.id, "arbitration confirmed new entity");
                settled += 1;
            }
            ArbiterVerdict::Inconclusive => {}
        }
    }

    Ok(settled)
}
