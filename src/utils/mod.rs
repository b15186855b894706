//! Shared utilities: the crate error type and logging setup.

pub mod error;
pub mod logging;

pub use error::{BrokerError, Entity, Result};

#[cfg(test)]
mod tests {
    use super::error::{BrokerError, Entity};
    use super::logging;

    #[test]
    fn level_names_parse() {
        use tracing::Level;
        assert_eq!(logging::parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(logging::parse_level("WARN"), Some(Level::WARN));
        assert_eq!(logging::parse_level("warning"), Some(Level::WARN));
        assert_eq!(logging::parse_level(" trace "), Some(Level::TRACE));
        assert_eq!(logging::parse_level("loud"), None);
    }

    #[test]
    fn logging_init_falls_back_to_info() {
        assert_eq!(logging::init("nonsense"), tracing::Level::INFO);
        // already installed; still reports the requested level
        assert_eq!(logging::init("error"), tracing::Level::ERROR);
    }

    #[test]
    fn errors_name_the_entity() {
        let err = BrokerError::not_found(Entity::Exchange, "orders");
        assert_eq!(err.to_string(), "exchange `orders` not found");

        let err = BrokerError::conflict(Entity::Queue, "jobs", "durable differs");
        assert_eq!(
            err.to_string(),
            "queue `jobs` conflicts with existing declaration: durable differs"
        );
    }
}
