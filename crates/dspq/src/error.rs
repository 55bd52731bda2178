//! Error taxonomy shared by every queue operation.

use dspq_shm::{CodecError, LayoutError};

/// Errors returned by queue operations.
///
/// `WouldBlock`, `Expired` and `Interrupted` are retry signals for the
/// immediate caller. `BadState`, `ConnectionReset` and `CorruptedItem` are
/// terminal for the queue: close it and create a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum QueueError {
    /// Queue full (write) or empty (read/peek).
    #[error("operation would block")]
    WouldBlock,
    /// Caller misuse: sizes, counts or flags out of range.
    #[error("bad parameter")]
    BadParameter,
    /// A referenced buffer is not mapped to the target domain.
    #[error("buffer not mapped to domain")]
    NoSuchMapping,
    /// Ring contents are inconsistent.
    #[error("queue contents corrupted")]
    CorruptedItem,
    /// Queue unusable; close and recreate it.
    #[error("queue in bad state")]
    BadState,
    /// A blocking call timed out.
    #[error("timed out")]
    Expired,
    /// A blocking call was cancelled by close or domain failure.
    #[error("interrupted")]
    Interrupted,
    /// Feature absent on the remote side.
    #[error("unsupported")]
    Unsupported,
    /// The remote process exited or its subsystem restarted.
    #[error("connection reset by remote domain")]
    ConnectionReset,
    /// Already imported, or still imported by the remote side.
    #[error("item busy")]
    ItemBusy,
    /// Out of slots or shared memory.
    #[error("out of resources")]
    NoResources,
}

/// Result alias used throughout the crate.
pub type Result<T, E = QueueError> = std::result::Result<T, E>;

impl QueueError {
    const ALL: [QueueError; 11] = [
        QueueError::WouldBlock,
        QueueError::BadParameter,
        QueueError::NoSuchMapping,
        QueueError::CorruptedItem,
        QueueError::BadState,
        QueueError::Expired,
        QueueError::Interrupted,
        QueueError::Unsupported,
        QueueError::ConnectionReset,
        QueueError::ItemBusy,
        QueueError::NoResources,
    ];

    /// Stable code stored in shared memory and in the domain's dead flag.
    pub fn code(self) -> i32 {
        match self {
            QueueError::WouldBlock => -1,
            QueueError::BadParameter => -2,
            QueueError::NoSuchMapping => -3,
            QueueError::CorruptedItem => -4,
            QueueError::BadState => -5,
            QueueError::Expired => -6,
            QueueError::Interrupted => -7,
            QueueError::Unsupported => -8,
            QueueError::ConnectionReset => -9,
            QueueError::ItemBusy => -10,
            QueueError::NoResources => -11,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.code() == code)
    }

    /// Terminal errors for the whole domain when they come from signaling
    /// or remote calls.
    pub fn is_domain_fatal(self) -> bool {
        matches!(self, QueueError::BadState | QueueError::ConnectionReset)
    }
}

impl From<LayoutError> for QueueError {
    fn from(e: LayoutError) -> Self {
        match e {
            LayoutError::RingTooLarge { .. } | LayoutError::RegionTooSmall { .. } => {
                QueueError::BadParameter
            }
            LayoutError::UnexpectedFlags(_) | LayoutError::UnsupportedVersion(_) => {
                QueueError::Unsupported
            }
            LayoutError::InvalidDirection(_) => QueueError::CorruptedItem,
        }
    }
}

impl From<CodecError> for QueueError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Corrupted { .. } => QueueError::CorruptedItem,
            CodecError::OutputTooSmall { .. }
            | CodecError::TooLarge { .. }
            | CodecError::LimitExceeded => QueueError::BadParameter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for e in QueueError::ALL {
            assert!(e.code() < 0);
            assert_eq!(QueueError::from_code(e.code()), Some(e));
        }
        assert_eq!(QueueError::from_code(0), None);
        assert_eq!(QueueError::from_code(-1000), None);
    }

    #[test]
    fn layout_errors_map_to_taxonomy() {
        assert_eq!(
            QueueError::from(LayoutError::UnexpectedFlags(0x10)),
            QueueError::Unsupported
        );
        assert_eq!(
            QueueError::from(LayoutError::RingTooLarge { size: 1, max: 0 }),
            QueueError::BadParameter
        );
        assert_eq!(
            QueueError::from(CodecError::Corrupted { pos: 0, reason: "x" }),
            QueueError::CorruptedItem
        );
    }
}
