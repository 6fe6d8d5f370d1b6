//! In-memory cluster model for identity consolidation.
//!
//! A cluster is a two-level forest: one primary contact plus the
//! secondaries that point directly at it. Secondaries never point at
//! secondaries, so membership never requires a recursive walk — mapping
//! matched contacts to their governing primaries and fetching by that id
//! set covers the whole cluster in two passes.
//!
//! Everything here is pure: the storage engine converts rows to
//! [`ContactSnapshot`]s, runs the planning functions, and issues the
//! resulting mutations itself inside one transaction.

use std::collections::BTreeSet;

use crate::error::Error;
use crate::identity::{ConsolidatedContact, IdentityInput};

/// Linkage state of a stored contact.
///
/// Modeled as a sum type so a secondary cannot exist without its owning
/// primary id, and a primary cannot carry one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    Primary,
    Secondary { owner_id: i64 },
}

impl Linkage {
    #[must_use]
    pub const fn is_primary(self) -> bool {
        matches!(self, Self::Primary)
    }

    /// The owning primary's id, when this is a secondary.
    #[must_use]
    pub const fn owner(self) -> Option<i64> {
        match self {
            Self::Primary => None,
            Self::Secondary { owner_id } => Some(owner_id),
        }
    }
}

/// Snapshot of one stored contact as the engine sees it mid-transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactSnapshot {
    pub id: i64,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub linkage: Linkage,
    /// Microseconds since the Unix epoch; immutable, so primary seniority
    /// is stable across merges.
    pub created_at: i64,
}

impl ContactSnapshot {
    /// The id of the primary governing this contact (itself when primary).
    #[must_use]
    pub const fn governing_primary_id(&self) -> i64 {
        match self.linkage {
            Linkage::Primary => self.id,
            Linkage::Secondary { owner_id } => owner_id,
        }
    }
}

/// Distinct governing primary ids for a set of matched contacts.
#[must_use]
pub fn governing_primary_ids(matches: &[ContactSnapshot]) -> BTreeSet<i64> {
    matches
        .iter()
        .map(ContactSnapshot::governing_primary_id)
        .collect()
}

/// Outcome of collision planning: the surviving primary and the primaries
/// it absorbs, in seniority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub true_primary_id: i64,
    /// Junior primaries to demote, oldest first. Empty when the cluster
    /// already has a single primary.
    pub loser_ids: Vec<i64>,
}

impl MergePlan {
    #[must_use]
    pub fn needs_merge(&self) -> bool {
        !self.loser_ids.is_empty()
    }
}

/// Decide the surviving primary for an expanded cluster.
///
/// Seniority is (`created_at`, `id`) ascending — ids are monotonic and
/// unique, so the order is total and independent of request arrival order.
/// Re-applying the plan to an already-unified cluster yields an empty
/// loser list (no-op).
pub fn plan_merge(cluster: &[ContactSnapshot]) -> Result<MergePlan, Error> {
    let mut primaries: Vec<&ContactSnapshot> = cluster
        .iter()
        .filter(|c| c.linkage.is_primary())
        .collect();
    if primaries.is_empty() {
        return Err(Error::NoPrimaryInCluster);
    }
    primaries.sort_by_key(|c| (c.created_at, c.id));
    Ok(MergePlan {
        true_primary_id: primaries[0].id,
        loser_ids: primaries[1..].iter().map(|c| c.id).collect(),
    })
}

/// Validate the one-hop forest shape of an expanded cluster.
///
/// Every secondary must point at a primary that is present in the cluster;
/// anything else is corrupt stored state, propagated as an error rather
/// than patched.
pub fn validate(cluster: &[ContactSnapshot]) -> Result<(), Error> {
    for contact in cluster {
        if let Linkage::Secondary { owner_id } = contact.linkage {
            match cluster.iter().find(|c| c.id == owner_id) {
                Some(owner) if owner.linkage.is_primary() => {}
                Some(_) => {
                    return Err(Error::SecondaryChain {
                        id: contact.id,
                        linked_id: owner_id,
                    });
                }
                None => {
                    return Err(Error::DanglingLink {
                        id: contact.id,
                        linked_id: owner_id,
                    });
                }
            }
        }
    }
    Ok(())
}

/// Whether the input carries an email or phone recorded nowhere in the
/// cluster. Novelty on either field is enough.
#[must_use]
pub fn is_novel(cluster: &[ContactSnapshot], input: &IdentityInput) -> bool {
    let novel_email = input
        .email
        .as_deref()
        .is_some_and(|e| !cluster.iter().any(|c| c.email.as_deref() == Some(e)));
    let novel_phone = input
        .phone
        .as_deref()
        .is_some_and(|p| !cluster.iter().any(|c| c.phone.as_deref() == Some(p)));
    novel_email || novel_phone
}

/// Build the consolidated view for a unified cluster.
///
/// The primary's own values lead each list; secondaries follow in cluster
/// order (callers pass the cluster sorted by creation). Nulls and values
/// already emitted are skipped. This ordering is part of the observable
/// contract.
pub fn project(
    cluster: &[ContactSnapshot],
    primary_id: i64,
) -> Result<ConsolidatedContact, Error> {
    let primary = cluster
        .iter()
        .find(|c| c.id == primary_id && c.linkage.is_primary())
        .ok_or(Error::NoPrimaryInCluster)?;

    let mut emails = Vec::new();
    let mut phone_numbers = Vec::new();
    let mut secondary_contact_ids = Vec::new();

    push_unique(&mut emails, primary.email.as_deref());
    push_unique(&mut phone_numbers, primary.phone.as_deref());

    for contact in cluster {
        if contact.id == primary_id {
            continue;
        }
        push_unique(&mut emails, contact.email.as_deref());
        push_unique(&mut phone_numbers, contact.phone.as_deref());
        secondary_contact_ids.push(contact.id);
    }

    Ok(ConsolidatedContact {
        primary_contact_id: primary_id,
        emails,
        phone_numbers,
        secondary_contact_ids,
    })
}

fn push_unique(values: &mut Vec<String>, value: Option<&str>) {
    if let Some(v) = value {
        if !values.iter().any(|existing| existing == v) {
            values.push(v.to_string());
        }
    }
}
