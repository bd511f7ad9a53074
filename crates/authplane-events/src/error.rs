//! Event bus error primitives.

use std::error::Error;
use std::fmt::{self, Display, Formatter};

/// Errors raised while publishing or subscribing.
#[derive(Debug)]
pub enum EventBusError {
    /// The event was rejected before reaching the transport.
    InvalidEvent {
        /// Machine-readable reason for the rejection.
        reason: &'static str,
    },
    /// Encoding the event envelope failed.
    Encode {
        /// Underlying serde error.
        source: serde_json::Error,
    },
    /// The transport refused the operation.
    Transport {
        /// Operation identifier.
        operation: &'static str,
        /// Topic the operation targeted.
        topic: String,
        /// Transport-specific failure detail.
        detail: String,
    },
}

impl EventBusError {
    /// Convenience constructor for transport failures.
    #[must_use]
    pub fn transport(
        operation: &'static str,
        topic: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self::Transport {
            operation,
            topic: topic.into(),
            detail: detail.into(),
        }
    }
}

impl Display for EventBusError {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEvent { .. } => formatter.write_str("invalid event"),
            Self::Encode { .. } => formatter.write_str("failed to encode event"),
            Self::Transport { .. } => formatter.write_str("event transport operation failed"),
        }
    }
}

impl Error for EventBusError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Encode { source } => Some(source),
            Self::InvalidEvent { .. } | Self::Transport { .. } => None,
        }
    }
}

/// Result wrapper for event bus operations.
pub type EventBusResult<T> = Result<T, EventBusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_bus_error_display_and_source() {
        let invalid = EventBusError::InvalidEvent {
            reason: "missing_type",
        };
        assert_eq!(invalid.to_string(), "invalid event");
        assert!(invalid.source().is_none());

        let Err(json) = serde_json::from_str::<serde_json::Value>("{") else {
            panic!("expected malformed json to fail");
        };
        let encode = EventBusError::Encode { source: json };
        assert_eq!(encode.to_string(), "failed to encode event");
        assert!(encode.source().is_some());

        let transport = EventBusError::transport("publish", "auth.user.signed_up", "closed");
        assert_eq!(transport.to_string(), "event transport operation failed");
        assert!(matches!(
            transport,
            EventBusError::Transport { ref topic, .. } if topic == "auth.user.signed_up"
        ));
    }
}
