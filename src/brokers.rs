/// Broker connection strings for the cluster under test.
use crate::config::BrokersConfig;

/// Anything that can tell a client where the brokers are.
pub trait BrokerSource: Send + Sync {
    /// Comma-separated `host:port` list usable as a client bootstrap target.
    fn brokers(&self) -> String;
}

/// A fixed list of broker addresses.
#[derive(Debug, Clone)]
pub struct StaticBrokers {
    addresses: Vec<String>,
}

impl StaticBrokers {
    pub fn new(addresses: Vec<String>) -> Self {
        Self { addresses }
    }

    pub fn from_config(config: &BrokersConfig) -> Self {
        Self::new(config.addresses.clone())
    }
}

impl BrokerSource for StaticBrokers {
    fn brokers(&self) -> String {
        self.addresses.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_broker() {
        let brokers = StaticBrokers::new(vec!["localhost:9092".to_string()]);
        assert_eq!(brokers.brokers(), "localhost:9092");
    }

    #[test]
    fn test_multiple_brokers_comma_joined() {
        let brokers = StaticBrokers::new(vec![
            "10.0.0.1:9092".to_string(),
            "10.0.0.2:9092".to_string(),
            "10.0.0.3:9092".to_string(),
        ]);
        assert_eq!(
            brokers.brokers(),
            "10.0.0.1:9092,10.0.0.2:9092,10.0.0.3:9092"
        );
    }

    #[test]
    fn test_from_config_defaults() {
        let brokers = StaticBrokers::from_config(&BrokersConfig::default());
        assert_eq!(brokers.brokers(), "localhost:9092");
    }
}
