use super::BrokerConfig;
use crate::Result;
use config::{Config, Environment};

/// Environment variable prefix, e.g. `MQUEUE_MAX_CONNECTIONS`.
pub const ENV_PREFIX: &str = "MQUEUE";

impl BrokerConfig {
    /// Defaults overlaid with any `MQUEUE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_environment(Environment::with_prefix(ENV_PREFIX))
    }

    pub(crate) fn from_environment(env: Environment) -> Result<Self> {
        let settings = Config::builder()
            .add_source(env.try_parsing(true))
            .build()
            .map_err(|e| crate::MqError::Config(e.to_string()))?;

        let config = settings
            .try_deserialize::<BrokerConfig>()
            .map_err(|e| crate::MqError::Config(e.to_string()))?;

        Ok(config)
    }
}
