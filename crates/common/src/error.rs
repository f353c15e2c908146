use thiserror::Error;

/// Canonical spillway error taxonomy used across crates.
///
/// Classification guidance:
/// - [`SpillwayError::InvalidConfig`]: spill paths, codec names, thresholds or schemas rejected at construction
/// - [`SpillwayError::ResourceExhausted`]: memory or spill-space reservations that were denied
/// - [`SpillwayError::Corruption`]: spill records whose markers, sizes or checksums do not decode
/// - [`SpillwayError::Execution`]: runtime state violations, cipher failures, worker-pool failures
/// - [`SpillwayError::Unsupported`]: column types the page serde cannot spill
/// - [`SpillwayError::Io`]: raw filesystem IO failures from std APIs
#[derive(Debug, Error)]
pub enum SpillwayError {
    /// Invalid or inconsistent configuration.
    ///
    /// Examples:
    /// - empty spill path list, or a spill path that is not writable
    /// - unknown compression codec name
    /// - used-space threshold outside `(0, 1]`
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A reservation was refused by an accounting layer.
    ///
    /// Callers should treat this as backpressure; nothing retries internally.
    ///
    /// Examples:
    /// - memory context limit exceeded
    /// - per-query or per-node spill limit exceeded
    /// - no spill directory with free space left
    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),

    /// Runtime failures after construction succeeded.
    ///
    /// Examples:
    /// - spill submitted while another spill is in flight
    /// - readback requested before anything was spilled
    /// - batch types do not match the spiller schema
    #[error("execution error: {0}")]
    Execution(String),

    /// A spill record could not be decoded.
    ///
    /// Examples:
    /// - truncated header or payload
    /// - reserved marker bits set
    /// - checksum mismatch
    #[error("corrupt spill data: {0}")]
    Corruption(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Valid request for a shape not implemented in current version.
    ///
    /// Examples:
    /// - spilling a dictionary-encoded column
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Standard spillway result alias.
pub type Result<T> = std::result::Result<T, SpillwayError>;
