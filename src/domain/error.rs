//! Error types surfaced through operation callbacks.

use thiserror::Error;

/// A failure reported natively by the transport stack.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct TransportError {
    reason: String,
}

impl TransportError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Why an accepted operation did not succeed.
///
/// `InvalidState` never reaches a callback: the callback API reports it as a
/// `false` return. It only shows up from the awaitable wrappers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BleError {
    #[error("connect timed out")]
    ConnectTimeout,

    #[error("service enumeration timed out")]
    EnumerateTimeout,

    #[error("write acknowledgement timed out")]
    SendDataTimeout,

    #[error("read response timed out")]
    ReadTimeout,

    #[error("notification subscription timed out")]
    SubscribeTimeout,

    #[error("transport rejected the operation: {0}")]
    TransportRejected(#[from] TransportError),

    #[error("peripheral disconnected")]
    PeripheralDisconnected,

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("operation cancelled")]
    Cancelled,
}

impl BleError {
    /// True for the coordinator-imposed deadline variants.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout
                | Self::EnumerateTimeout
                | Self::SendDataTimeout
                | Self::ReadTimeout
                | Self::SubscribeTimeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_reason_is_wrapped() {
        let err: BleError = TransportError::new("GATT 0x85").into();
        assert_eq!(
            err.to_string(),
            "transport rejected the operation: GATT 0x85"
        );
        assert!(!err.is_timeout());
    }

    #[test]
    fn timeout_variants() {
        assert!(BleError::ConnectTimeout.is_timeout());
        assert!(BleError::SubscribeTimeout.is_timeout());
        assert!(!BleError::Cancelled.is_timeout());
        assert!(!BleError::PeripheralDisconnected.is_timeout());
    }
}
