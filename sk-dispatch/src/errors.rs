//! Error taxonomy surfaced by the dispatcher.

use std::io;

use thiserror::Error;

pub type Result<T, E = DispatchError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("dispatcher already loaded")]
    AlreadyLoaded,

    #[error("dispatcher not loaded")]
    NotLoaded,

    #[error("state directory is locked by another process")]
    Busy,

    #[error("already bound to label {0:?}")]
    AlreadyBound(String),

    #[error("binding not found")]
    NotFound,

    #[error("binding does not belong to label {0:?}")]
    LabelMismatch(String),

    #[error("no free label ids")]
    Full,

    #[error("invalid label name {0:?}")]
    InvalidName(String),

    #[error("unsupported socket: {0}")]
    Unsupported(String),

    #[error("corrupt state: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("bpf map error: {0}")]
    Map(#[from] aya::maps::MapError),

    #[error("bpf program error: {0}")]
    Program(#[from] aya::programs::ProgramError),

    #[error("bpf load error: {0}")]
    Load(#[from] aya::EbpfError),

    #[error("bpf pin error: {0}")]
    Pin(#[from] aya::pin::PinError),

    #[error("bpf link error: {0}")]
    Link(#[from] aya::programs::links::LinkError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert() {
        let err: DispatchError =
            io::Error::new(io::ErrorKind::PermissionDenied, "denied").into();
        assert!(matches!(err, DispatchError::Io(_)));
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn taxonomy_messages() {
        assert_eq!(
            DispatchError::AlreadyBound("web".into()).to_string(),
            "already bound to label \"web\""
        );
        assert_eq!(DispatchError::NotLoaded.to_string(), "dispatcher not loaded");
        assert_eq!(
            DispatchError::Busy.to_string(),
            "state directory is locked by another process"
        );
    }
}
