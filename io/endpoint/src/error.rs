use std::fmt;
use std::io;

/// Transport-level status attached to every error the endpoint surfaces.
///
/// Shutdown and fork-generation failures map to `Cancelled`; everything else
/// maps to `Unavailable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Unavailable,
    Cancelled,
}

/// Errors surfaced through read/write completion callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    /// The peer closed the connection (zero-length read).
    ClosedByPeer,
    /// A non-recoverable `recvmsg`/`sendmsg` failure, with the OS error text.
    Io { op: &'static str, detail: String },
    /// Shutdown was requested, or the descriptor belongs to a pre-fork
    /// generation.
    Cancelled { reason: String },
    /// Operation attempted after the memory owner was reset.
    ShuttingDown,
    /// Write attempted on a handle that is already shut.
    Eof,
}

impl EndpointError {
    /// Build an [`EndpointError::Io`] from a syscall name and errno.
    pub fn os(op: &'static str, errno: i32) -> Self {
        EndpointError::Io {
            op,
            detail: io::Error::from_raw_os_error(errno).to_string(),
        }
    }

    /// Build an [`EndpointError::Cancelled`] with a reason.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        EndpointError::Cancelled {
            reason: reason.into(),
        }
    }

    /// The transport status this error is annotated with.
    pub fn transport_status(&self) -> TransportStatus {
        match self {
            EndpointError::Cancelled { .. } => TransportStatus::Cancelled,
            _ => TransportStatus::Unavailable,
        }
    }
}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointError::ClosedByPeer => write!(f, "socket closed"),
            EndpointError::Io { op, detail } => write!(f, "{op}: {detail}"),
            EndpointError::Cancelled { reason } => write!(f, "cancelled: {reason}"),
            EndpointError::ShuttingDown => write!(f, "shutting down endpoint"),
            EndpointError::Eof => write!(f, "EOF"),
        }
    }
}

impl std::error::Error for EndpointError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_status() {
        assert_eq!(
            EndpointError::ClosedByPeer.transport_status(),
            TransportStatus::Unavailable
        );
        assert_eq!(
            EndpointError::cancelled("closed on fork").transport_status(),
            TransportStatus::Cancelled
        );
        assert_eq!(
            EndpointError::Eof.transport_status(),
            TransportStatus::Unavailable
        );
    }

    #[test]
    fn test_display_includes_os_text() {
        let err = EndpointError::os("sendmsg", libc::ECONNRESET);
        let text = err.to_string();
        assert!(text.starts_with("sendmsg: "));
        assert!(text.len() > "sendmsg: ".len());
    }
}
