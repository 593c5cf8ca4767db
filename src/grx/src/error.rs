//! Return values from function calls.

/// Everything that can go wrong inside the runtime, as a flat kind taxonomy.
///
/// Each variant carries a one-line diagnostic so call sites stay greppable
/// without a separate error type per subsystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Host or device allocation exhausted, or the memory budget would be
    /// exceeded by the requested allocation.
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),
    /// A count or index fell outside its valid range.
    #[error("out of bounds: {0}")]
    OutOfBounds(&'static str),
    /// The call is not valid in the current recording / submission state.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
    /// A required argument was missing or malformed.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    /// Internal state no longer matches what the call requires
    /// (stale swapchain version, device marked lost, ...).
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// The selected backend cannot perform the requested operation.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),
    /// No matching entity was found (memory type, compatible device, ...).
    #[error("not found: {0}")]
    NotFound(&'static str),
    /// A backend wait returned its timed-out sentinel.
    #[error("timed out: {0}")]
    TimedOut(&'static str),
}

impl Error {
    /// Whether the error indicates the device can no longer be used.
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Error::InvalidState(msg) if msg.contains("device lost"))
    }
}

/// Convenience alias used by every fallible hot path.
pub type Result<T, E = Error> = std::result::Result<T, E>;
