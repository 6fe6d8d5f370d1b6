//! Database models using sqlmodel derive macros
//!
//! The `contacts` table is the sole entity. Datetime fields use `i64`
//! (microseconds since Unix epoch) for sqlmodel compatibility.

use serde::{Deserialize, Serialize};
use sqlmodel::Model;

use idweld_core::cluster::{ContactSnapshot, Linkage};
use idweld_core::Error as CoreError;

use crate::timestamps::{micros_to_naive, now_micros};

/// Stored value of `link_precedence` for a canonical contact.
pub const PRECEDENCE_PRIMARY: &str = "primary";
/// Stored value of `link_precedence` for a subordinate contact.
pub const PRECEDENCE_SECONDARY: &str = "secondary";

/// One stored contact: an email/phone observation tied to a customer.
///
/// # Constraints
/// - At least one of `email`/`phone_number` is non-null for every row the
///   engine creates.
/// - `linked_id` is set iff `link_precedence = 'secondary'`, and points at
///   a primary row (one hop, never deeper).
/// - `created_at` is immutable; `updated_at` is bumped on linkage changes.
/// - `deleted_at` is a tombstone: set means invisible to every read.
#[derive(Model, Debug, Clone, Serialize, Deserialize)]
#[sqlmodel(table = "contacts")]
pub struct ContactRow {
    #[sqlmodel(primary_key, auto_increment)]
    pub id: Option<i64>,

    pub email: Option<String>,

    pub phone_number: Option<String>,

    pub link_precedence: String,

    pub linked_id: Option<i64>,

    /// Microseconds since Unix epoch; never mutated after insert.
    pub created_at: i64,

    pub updated_at: i64,

    pub deleted_at: Option<i64>,
}

impl Default for ContactRow {
    fn default() -> Self {
        let now = now_micros();
        Self {
            id: None,
            email: None,
            phone_number: None,
            link_precedence: PRECEDENCE_PRIMARY.to_string(),
            linked_id: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

impl ContactRow {
    /// Fresh primary contact for an input that matched nothing.
    #[must_use]
    pub fn new_primary(email: Option<String>, phone_number: Option<String>) -> Self {
        Self {
            email,
            phone_number,
            ..Self::default()
        }
    }

    /// New secondary carrying novel information into an existing cluster.
    #[must_use]
    pub fn new_secondary(
        email: Option<String>,
        phone_number: Option<String>,
        owner_id: i64,
    ) -> Self {
        Self {
            email,
            phone_number,
            link_precedence: PRECEDENCE_SECONDARY.to_string(),
            linked_id: Some(owner_id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.link_precedence == PRECEDENCE_PRIMARY
    }

    /// Decode the stored precedence/link pairing into the core sum type,
    /// rejecting inconsistent pairings (primary with a link, secondary
    /// without one).
    pub fn linkage(&self) -> Result<Linkage, CoreError> {
        let id = self.id.ok_or(CoreError::MissingId)?;
        match (self.is_primary(), self.linked_id) {
            (true, None) => Ok(Linkage::Primary),
            (false, Some(owner_id)) => Ok(Linkage::Secondary { owner_id }),
            _ => Err(CoreError::ConflictingLinkage { id }),
        }
    }

    /// Convert to the in-memory snapshot the pure consolidation logic runs on.
    pub fn snapshot(&self) -> Result<ContactSnapshot, CoreError> {
        Ok(ContactSnapshot {
            id: self.id.ok_or(CoreError::MissingId)?,
            email: self.email.clone(),
            phone: self.phone_number.clone(),
            linkage: self.linkage()?,
            created_at: self.created_at,
        })
    }

    /// Get `created_at` as `NaiveDateTime`
    #[must_use]
    pub fn created_at_naive(&self) -> chrono::NaiveDateTime {
        micros_to_naive(self.created_at)
    }
}
