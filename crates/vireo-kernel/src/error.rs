use thiserror::Error;

/// Error taxonomy returned from kernel operations. Each variant is a
/// distinct negative code at the syscall boundary (see [`KernelError::code`]).
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum KernelError {
    #[error("invalid argument")]
    InvalidArgument,

    #[error("bad handle")]
    BadHandle,

    #[error("wrong object type for this operation")]
    WrongType,

    #[error("permission denied")]
    PermissionDenied,

    #[error("peer endpoint closed")]
    PeerClosed,

    #[error("operation would block")]
    WouldBlock,

    #[error("peer queue full")]
    QueueFull,

    #[error("message exceeds MAX_MSG_SIZE")]
    MessageTooLarge,

    #[error("message exceeds MAX_MSG_HANDLES")]
    TooManyHandles,

    #[error("out of memory")]
    NoMemory,

    #[error("not found")]
    NotFound,
}

impl KernelError {
    /// The stable negative code surfaced to a syscall caller.
    pub const fn code(self) -> i64 {
        match self {
            KernelError::InvalidArgument => -1,
            KernelError::BadHandle => -2,
            KernelError::WrongType => -3,
            KernelError::PermissionDenied => -4,
            KernelError::PeerClosed => -5,
            KernelError::WouldBlock => -6,
            KernelError::QueueFull => -7,
            KernelError::MessageTooLarge => -8,
            KernelError::TooManyHandles => -9,
            KernelError::NoMemory => -10,
            KernelError::NotFound => -11,
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
