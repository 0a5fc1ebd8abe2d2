use deadpool_postgres::{BuildError, Manager, ManagerConfig, Pool, RecyclingMethod};
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_postgres::{Config as PgConfig, NoTls};
use tracing::{info, warn};

use crate::database::memory::MemoryStore;
use crate::database::postgres::PgStore;
use crate::database::{DocumentStore, StoreError};
use crate::services::counters::{CounterAggregator, ShardWriter};
use crate::services::pager::{DEFAULT_PAGE_SIZE, PagerRegistry};
use crate::services::text::{
    AnthropicConfig, AnthropicTextService, DEFAULT_MODEL, TextError, TextService,
};
use crate::utils::thread_state::set_server_id;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("${0} missing")]
    Missing(&'static str),

    #[error("${var} has invalid value {value:?}")]
    Invalid { var: &'static str, value: String },
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    env::var(var).map_err(|_| ConfigError::Missing(var))
}

fn optional(var: &'static str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.is_empty())
}

fn parsed<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(var) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        None => Ok(default),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    host: String,
    user: String,
    database: String,
    connections: u32,
    password: String,
}

impl PostgresConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: required("POSTGRES_HOST")?,
            user: required("POSTGRES_USER")?,
            database: required("POSTGRES_DATABASE")?,
            password: required("POSTGRES_PASSWORD")?,
            connections: parsed("POSTGRES_CONNECTIONS", 64)?,
        })
    }

    fn pool(&self) -> Result<Pool, BuildError> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&self.host);
        pg_config.user(&self.user);
        pg_config.password(&self.password);
        pg_config.dbname(&self.database);

        let mgr = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        Pool::builder(mgr)
            .max_size(self.connections as usize)
            .build()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub signature_key: String,
    pub url: String,
    pub server_id: u8,
    pub backend: StoreBackend,
    pub pubsub_url: Option<String>,
    pub page_size: usize,
    pub pager_idle: Duration,
    pub public_storage_url: String,
    pub anthropic: Option<AnthropicConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend = match optional("STORE_BACKEND") {
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::Invalid {
                    var: "STORE_BACKEND",
                    value,
                })?,
            None => StoreBackend::Postgres,
        };

        let anthropic = match optional("ANTHROPIC_API_KEY") {
            Some(api_key) => Some(AnthropicConfig {
                api_key,
                model: optional("ANTHROPIC_MODEL").unwrap_or(DEFAULT_MODEL.to_string()),
                timeout_secs: parsed("ANTHROPIC_TIMEOUT_SECS", 30)?,
                max_tokens: parsed("ANTHROPIC_MAX_TOKENS", 1024)?,
            }),
            None => None,
        };

        Ok(Self {
            signature_key: required("SIGNATURE_KEY")?,
            url: optional("URL").unwrap_or("localhost:8080".to_string()),
            server_id: parsed("SERVER_ID", 0)?,
            backend,
            pubsub_url: optional("PUBSUB_REDIS_URL"),
            page_size: parsed("FEED_PAGE_SIZE", DEFAULT_PAGE_SIZE)?,
            pager_idle: Duration::from_secs(parsed("PAGER_IDLE_SECS", 1800)?),
            public_storage_url: optional("PUBLIC_STORAGE_URL")
                .unwrap_or("https://storage.connecthub.app".to_string()),
            anthropic,
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub config: Arc<Config>,
    pub text: Option<Arc<dyn TextService>>,
    pub pagers: Arc<PagerRegistry>,
    pub shards: ShardWriter,
}

#[derive(Error, Debug)]
pub enum AppStateError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("pool error: {0}")]
    Pool(#[from] BuildError),

    #[error("text service error: {0}")]
    Text(#[from] TextError),
}

impl AppState {
    /// Wire services around `store` and start the counter aggregator.
    /// Must be called inside a Tokio runtime.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        config: Config,
        text: Option<Arc<dyn TextService>>,
    ) -> Self {
        let (folds_tx, folds_rx) = mpsc::unbounded_channel();
        tokio::spawn(CounterAggregator::new(store.clone()).run(folds_rx));

        AppState {
            pagers: Arc::new(PagerRegistry::new(
                store.clone(),
                config.page_size,
                config.pager_idle,
            )),
            shards: ShardWriter::new(store.clone(), Some(folds_tx)),
            config: Arc::new(config),
            store,
            text,
        }
    }

    pub async fn create_from_env() -> Result<AppState, AppStateError> {
        let config = Config::from_env()?;
        set_server_id(config.server_id);

        let store: Arc<dyn DocumentStore> = match config.backend {
            StoreBackend::Postgres => {
                let pool = PostgresConfig::from_env()?.pool()?;
                Arc::new(PgStore::connect(Arc::new(pool), config.pubsub_url.as_deref()).await?)
            }
            StoreBackend::Memory => {
                warn!("Using the in-memory store; nothing will be persisted");
                Arc::new(MemoryStore::new())
            }
        };

        let text: Option<Arc<dyn TextService>> = match &config.anthropic {
            Some(anthropic) => Some(Arc::new(AnthropicTextService::new(anthropic.clone())?)),
            None => {
                info!("ANTHROPIC_API_KEY not set; classification and assist are disabled");
                None
            }
        };

        Ok(AppState::new(store, config, text))
    }
}

pub type ArcAppState = Arc<AppState>;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_parse() {
        assert_eq!("memory".parse(), Ok(StoreBackend::Memory));
        assert_eq!("Postgres".parse(), Ok(StoreBackend::Postgres));
        assert!("mongo".parse::<StoreBackend>().is_err());
    }
}
