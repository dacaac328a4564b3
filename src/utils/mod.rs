//! The `utils` module provides the pieces shared across the relay: the crate
//! error type and logging setup.

pub mod error;
pub mod logging;

pub use error::{RelayError, Result};

#[cfg(test)]
mod tests {
    use super::error::RelayError;
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        // Should not panic
        logging::init("info");
        logging::init("debug");
        logging::init("warn");
        logging::init("nonsense");
    }

    #[test]
    fn already_closed_errors_are_recognised() {
        let closed = RelayError::Transport(tungstenite::Error::ConnectionClosed);
        assert!(closed.is_already_closed());

        let already = RelayError::Transport(tungstenite::Error::AlreadyClosed);
        assert!(already.is_already_closed());

        let other = RelayError::UnknownTopic("news".to_string());
        assert!(!other.is_already_closed());
    }
}
