use thiserror::Error;

/// A validator rejected a proposed state. The reference was left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("validator #{index} rejected the proposed state")]
pub struct ValidationError {
    /// Position of the rejecting validator in registration order.
    pub index: usize,
}
