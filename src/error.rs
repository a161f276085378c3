use thiserror::Error;

/// Failures raised while turning constant-pool entries into handles.
/// These abort the current compilation; the stub converts them into a
/// pending exception on the thread.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("unresolved class at pool index {0}")]
    UnresolvedClass(u16),

    #[error("unresolved field at pool index {0}")]
    UnresolvedField(u16),

    #[error("unresolved method at pool index {0}")]
    UnresolvedMethod(u16),

    #[error("unresolved constant at pool index {0}")]
    UnresolvedConstant(u16),

    #[error("no such method {0}")]
    NoSuchMethod(String),

    /// An exception is already pending on the thread (for instance a
    /// failed class initializer reached during compilation); the caller
    /// must not replace it.
    #[error("pending exception")]
    Pending,
}
