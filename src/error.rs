//! Error types surfaced by the store.
//!
//! Every failure propagates to the caller; there is no silent recovery. A
//! failed mutation never commits, so the table stays consistent with the
//! last committed state.

/// Errors returned by [`IpcKv`](crate::IpcKv) and the layers below it.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A derived OS object name exceeds the host name limit.
    #[error("object name '{0}' is too long")]
    NameTooLong(String),

    /// The table name contains characters that cannot be embedded into
    /// shared memory object names.
    #[error("invalid table name '{0}'")]
    InvalidName(String),

    /// The host could not create, open or map a required segment.
    #[error("shared memory segment '{name}' unavailable - {msg}")]
    SegmentUnavailable { name: String, msg: String },

    /// The host could not create or open a semaphore or mutex, or a wait
    /// on one of them failed.
    #[error("cross-process lock '{name}' unavailable - {msg}")]
    LockUnavailable { name: String, msg: String },

    /// Key length is at or above `KEY_SIZE - 1`.
    #[error("key length {0} exceeds the key size limit")]
    KeyTooLong(usize),

    /// Value length is at or above `DATA_SIZE`.
    #[error("value length {0} exceeds the value size limit")]
    ValueTooLong(usize),

    /// The probe sequence visited every bucket without finding a slot.
    /// Unreachable while the load factor invariant holds; treat as a bug.
    #[error("unable to insert item - probe sequence exhausted")]
    InsertFailed,

    /// A controller accessor was used outside its contract, e.g. a commit
    /// without a started transaction or an out-of-range bucket index.
    #[error("invalid controller state - {0}")]
    InvalidState(&'static str),
}
