//! Error types for the consolidation domain

use thiserror::Error;

/// Result type alias for core consolidation operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error taxonomy.
///
/// `MissingIdentifier` is a caller error; everything else signals a
/// storage-consistency fault that the engine propagates rather than
/// silently patching.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    // ==========================================================================
    // Invalid Input
    // ==========================================================================
    #[error("identify request carries neither an email nor a phone number")]
    MissingIdentifier,

    // ==========================================================================
    // Invariant Violations
    // ==========================================================================
    #[error("cluster contains no primary contact")]
    NoPrimaryInCluster,

    #[error("contact {id} links to {linked_id}, which is not in its cluster")]
    DanglingLink { id: i64, linked_id: i64 },

    #[error("contact {id} links to {linked_id}, which is itself a secondary")]
    SecondaryChain { id: i64, linked_id: i64 },

    #[error("contact {id} has an inconsistent precedence/link pairing")]
    ConflictingLinkage { id: i64 },

    #[error("contact row decoded without an id")]
    MissingId,
}

impl Error {
    /// Whether this error indicates corrupt stored state (as opposed to a
    /// caller mistake).
    #[must_use]
    pub const fn is_consistency_fault(&self) -> bool {
        !matches!(self, Self::MissingIdentifier)
    }
}
