//! Guard for storage invariants
//!
//! A violated invariant means a caller asked for something that would
//! corrupt the block index, such as removing a message no block covers.
//! Debug builds panic on the spot; release builds log and refuse the
//! mutation by returning [`InvariantViolation`].

/// A mutation was refused because it would corrupt folder storage
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("storage invariant violated: {0}")]
pub struct InvariantViolation(pub String);

/// Report a violated invariant.
pub(crate) fn violation(message: String) -> anyhow::Error {
    log::error!("{}", message);
    debug_assert!(false, "{}", message);
    InvariantViolation(message).into()
}
