//! NBD subsystem errors.

use haven_core::ErrorKind;
use thiserror::Error;

/// Errors from port allocation and process management.
#[derive(Error, Debug)]
pub enum NbdError {
    /// Every port in the configured range is leased.
    #[error("no NBD ports available in range {min}-{max}")]
    NoPortsAvailable { min: u16, max: u16 },

    /// The port is outside the configured range.
    #[error("port {0} is outside the configured range")]
    PortOutOfRange(u16),

    /// A process is already tracked on this port.
    #[error("port {0} already has an active qemu-nbd process")]
    PortBusy(u16),

    /// No tracked process on this port.
    #[error("no qemu-nbd process tracked on port {0}")]
    ProcessNotFound(u16),

    /// Spawning or signalling the process failed.
    #[error("qemu-nbd {op} failed: {source}")]
    Process {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for NBD operations.
pub type NbdResult<T> = Result<T, NbdError>;

impl NbdError {
    /// Broad failure category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            NbdError::NoPortsAvailable { .. } | NbdError::PortBusy(_) => ErrorKind::Conflict,
            NbdError::PortOutOfRange(_) => ErrorKind::Validation,
            NbdError::ProcessNotFound(_) => ErrorKind::NotFound,
            NbdError::Process { .. } => ErrorKind::Dependency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            NbdError::NoPortsAvailable { min: 1, max: 2 }.kind(),
            ErrorKind::Conflict
        );
        assert_eq!(NbdError::ProcessNotFound(10100).kind(), ErrorKind::NotFound);
        assert_eq!(NbdError::PortOutOfRange(99).kind(), ErrorKind::Validation);
    }
}
