//! Lazy expiration checks against a document's deadline.

use docket_core::Document;

/// Returned by [`check_expiry`] to indicate whether and why a document has
/// expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    /// The document has not expired.
    NotExpired,
    /// `documentExpirationTimeMicros` is at or before the current time.
    Deadline,
}

/// Checks `document` against `now_micros`. A zero deadline never expires.
#[must_use]
pub fn check_expiry(document: &Document, now_micros: u64) -> ExpiryReason {
    if document.is_expired_at(now_micros) {
        ExpiryReason::Deadline
    } else {
        ExpiryReason::NotExpired
    }
}
