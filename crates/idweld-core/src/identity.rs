//! Identify request/response boundary types.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A normalized identify request: email and/or phone number, trimmed, with
/// blank strings collapsed to `None`.
///
/// The network layer is responsible for rejecting requests where both
/// identifiers are absent; [`IdentityInput::is_empty`] lets the engine
/// double-check before touching storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityInput {
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl IdentityInput {
    #[must_use]
    pub fn new(email: Option<&str>, phone: Option<&str>) -> Self {
        Self {
            email: normalize(email),
            phone: normalize(phone),
        }
    }

    /// True when neither identifier survived trimming.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.email.is_none() && self.phone.is_none()
    }

    /// Reject inputs with no identifier at all.
    pub const fn validate(&self) -> Result<(), Error> {
        if self.is_empty() {
            Err(Error::MissingIdentifier)
        } else {
            Ok(())
        }
    }
}

fn normalize(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Consolidated view of one customer identity cluster.
///
/// Field names serialize in camelCase — this is the wire contract the
/// out-of-scope network layer returns verbatim. Ordering matters:
/// the primary's own values lead `emails`/`phone_numbers`, followed by
/// secondaries in cluster (creation) order, duplicates skipped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedContact {
    pub primary_contact_id: i64,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub secondary_contact_ids: Vec<i64>,
}
