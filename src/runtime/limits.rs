//! Runtime limits.

/// Maximum size in bytes for the custom status string set via
/// `ctx.set_custom_status()`.
///
/// A turn whose final custom status exceeds this limit fails the
/// orchestration with `ConfigErrorKind::LimitExceeded` before the ack
/// commits; the status row stays bounded.
pub const MAX_CUSTOM_STATUS_BYTES: usize = 256 * 1024;
