use envconfig::Envconfig;
use log::debug;
use std::time::Duration;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "DATABASE_PATH", default = "data.db")]
    pub database_path: String,

    /// Identifier questions may use to address the database.
    #[envconfig(from = "DATABASE_ID", default = "main")]
    pub database_id: String,

    #[envconfig(from = "RULES_PATH", default = "business_rules.json")]
    pub rules_path: String,

    #[envconfig(from = "INTENT_TIMEOUT_SECS", default = "30")]
    pub intent_timeout_secs: u64,

    #[envconfig(from = "EXECUTION_TIMEOUT_SECS", default = "30")]
    pub execution_timeout_secs: u64,

    #[envconfig(from = "MAX_ROWS", default = "10000")]
    pub max_rows: usize,

    #[envconfig(from = "MAX_FILTERS", default = "10")]
    pub max_filters: usize,
}

impl Config {
    pub fn new() -> Result<Self, envconfig::Error> {
        let config = Self::init_from_env()?;
        debug!(
            "Config loaded: database_path={}, database_id={}, rules_path={}, max_rows={}, max_filters={}",
            config.database_path,
            config.database_id,
            config.rules_path,
            config.max_rows,
            config.max_filters
        );
        Ok(config)
    }

    pub fn intent_timeout(&self) -> Duration {
        Duration::from_secs(self.intent_timeout_secs)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }
}

#[derive(Envconfig, Clone)]
pub struct PostgresConfig {
    #[envconfig(from = "POSTGRES_USER", default = "postgres")]
    pub user: String,
    #[envconfig(from = "POSTGRES_PASSWORD", default = "postgres")]
    pub password: String,
    #[envconfig(from = "POSTGRES_HOST", default = "localhost:5432")]
    pub host: String,
    #[envconfig(from = "POSTGRES_DB", default = "main")]
    pub dbname: String,
}

impl PostgresConfig {
    pub fn new() -> Result<Self, envconfig::Error> {
        let config = Self::init_from_env()?;
        debug!(
            "PostgresConfig loaded: user={}, host={}, dbname={}",
            config.user, config.host, config.dbname
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();
        assert_eq!(config.max_rows, 10_000);
        assert_eq!(config.max_filters, 10);
        assert_eq!(config.execution_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let vars = HashMap::from([
            ("DATABASE_PATH".to_string(), "/tmp/shop.db".to_string()),
            ("MAX_ROWS".to_string(), "50".to_string()),
            ("INTENT_TIMEOUT_SECS".to_string(), "5".to_string()),
        ]);
        let config = Config::init_from_hashmap(&vars).unwrap();
        assert_eq!(config.database_path, "/tmp/shop.db");
        assert_eq!(config.max_rows, 50);
        assert_eq!(config.intent_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_rejects_bad_number() {
        let vars = HashMap::from([("MAX_ROWS".to_string(), "lots".to_string())]);
        assert!(Config::init_from_hashmap(&vars).is_err());
    }
}
