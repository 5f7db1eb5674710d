use thiserror::Error;

/// Erros "kernel-level" genéricos para subsistemas (mm, storage, fs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("invalid argument")]
    Invalid,
    #[error("permission denied")]
    PermissionDenied,
    #[error("out of physical memory")]
    NoMemory,
    #[error("out of swap space")]
    NoSwapSpace,
    #[error("i/o error")]
    IO,
    #[error("out of range")]
    OutOfRange,
}

pub type KResult<T> = core::result::Result<T, KError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(alloc::format!("{}", KError::NoSwapSpace), "out of swap space");
        assert_eq!(alloc::format!("{}", KError::IO), "i/o error");
    }
}
