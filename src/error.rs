use thiserror::Error;

/// Stable numeric cause codes carried in error acknowledgements so that
/// legacy clients can distinguish failures without parsing text.
pub mod code {
    pub const SYSTEM: i32 = 1000;
    pub const ALREADY_QUEUED: i32 = 1001;
    pub const REQUEST_NOT_FOUND: i32 = 1002;
    pub const DRIVE_NOT_FOUND: i32 = 1003;
    pub const UNKNOWN_GROUP: i32 = 1004;
    pub const BAD_STATE: i32 = 1005;
    pub const BAD_ID: i32 = 1006;
    pub const BAD_DEDICATION: i32 = 1007;
    pub const SERVER_HELD: i32 = 1008;
    pub const NOT_AUTHORIZED: i32 = 1009;
}

#[derive(Error, Debug)]
pub enum MountqError {
    /// Malformed header or payload. The connection is closed and no shared
    /// state is touched.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A well-formed request that cannot be honored. Surfaced to the caller
    /// as an error acknowledgement with a cause code; no state is mutated.
    #[error("validation error ({code}): {reason}")]
    Validation { code: i32, reason: String },

    /// Concurrent alteration detected during a match or delete. Retried
    /// internally via a fresh matching pass, never surfaced as a failure.
    #[error("resource conflict: {0}")]
    Conflict(String),

    /// The copy-execution service was unreachable or rejected the job.
    /// Triggers a scheduler rollback; the original client stays queued.
    #[error("dispatch failure for request {request_id} on {drive}: {reason}")]
    Dispatch {
        request_id: i32,
        drive: String,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MountqError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        MountqError::Protocol(msg.into())
    }

    pub fn validation(code: i32, reason: impl Into<String>) -> Self {
        MountqError::Validation {
            code,
            reason: reason.into(),
        }
    }

    /// Cause code sent back on the wire for this error.
    pub fn cause_code(&self) -> i32 {
        match self {
            MountqError::Validation { code, .. } => *code,
            _ => code::SYSTEM,
        }
    }
}

pub type Result<T> = std::result::Result<T, MountqError>;
