//! Process configuration. Every option is a CLI flag with an environment
//! variable fallback and a default from [`crate::defaults`].

use crate::ann::{EngineParams, SpaceType};
use crate::defaults;
use anyhow::{ensure, Result};
use clap::{ArgAction, Args};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Args)]
pub struct IndexConfig {
    /// Vector dimension shared by both indexes
    #[arg(long = "dim", env = "INDEX_DIM", default_value_t = defaults::DIMENSION)]
    pub dim: usize,

    /// HNSW graph fan-out
    #[arg(long = "hnsw-m", env = "HNSW_M", default_value_t = defaults::HNSW_M)]
    pub m: usize,

    #[arg(long, env = "HNSW_EF_CONSTRUCTION", default_value_t = defaults::HNSW_EF_CONSTRUCTION)]
    pub ef_construction: usize,

    /// Search breadth for HNSW queries
    #[arg(long = "ef", env = "HNSW_EF", default_value_t = defaults::HNSW_EF_SEARCH)]
    pub ef: usize,

    /// Maximum number of distinct documents per index
    #[arg(long, env = "MAX_ELEMENTS", default_value_t = defaults::MAX_ELEMENTS)]
    pub max_elements: usize,

    #[arg(long, env = "ADMISSION_MARGIN", default_value_t = defaults::ADMISSION_MARGIN)]
    pub admission_margin: usize,

    /// Serve vector queries from HNSW; when false every query uses the exact index
    #[arg(long, env = "HNSW_ENABLED", default_value_t = true, action = ArgAction::Set)]
    pub approximate_enabled: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dim: defaults::DIMENSION,
            m: defaults::HNSW_M,
            ef_construction: defaults::HNSW_EF_CONSTRUCTION,
            ef: defaults::HNSW_EF_SEARCH,
            max_elements: defaults::MAX_ELEMENTS,
            admission_margin: defaults::ADMISSION_MARGIN,
            approximate_enabled: true,
        }
    }
}

impl IndexConfig {
    pub fn engine_params(&self) -> EngineParams {
        EngineParams {
            dim: self.dim,
            m: self.m,
            ef_construction: self.ef_construction,
            ef: self.ef,
            max_elements: self.max_elements,
            space: SpaceType::Cosine,
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.dim > 0, "dim must be positive");
        ensure!(self.m > 0, "hnsw-m must be positive");
        ensure!(self.ef > 0, "ef must be positive");
        ensure!(self.ef_construction > 0, "ef-construction must be positive");
        ensure!(
            self.max_elements > self.admission_margin,
            "max-elements ({}) must exceed admission-margin ({})",
            self.max_elements,
            self.admission_margin
        );
        ensure!(
            self.max_elements <= u32::MAX as usize,
            "max-elements must fit in a 32-bit handle"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
pub struct PipelineConfig {
    #[arg(long, env = "INGEST_WORKERS", default_value_t = defaults::WORKER_COUNT)]
    pub workers: usize,

    /// Documents buffered between the producer and the workers
    #[arg(long, env = "INGEST_QUEUE_CAPACITY", default_value_t = defaults::QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    #[arg(long, env = "INGEST_BATCH_SIZE", default_value_t = defaults::FETCH_BATCH_SIZE)]
    pub batch_size: usize,

    /// Pause after a failed or empty fetch
    #[arg(long, env = "INGEST_BACKOFF_MS", default_value_t = defaults::FETCH_BACKOFF_MS)]
    pub backoff_ms: u64,

    /// Skip documents created longer ago than this (disabled when unset)
    #[arg(long, env = "INGEST_MAX_AGE_SECS")]
    pub max_age_secs: Option<u64>,

    #[arg(skip = defaults::MAX_ELEMENTS)]
    pub max_elements: usize,

    #[arg(skip = defaults::ADMISSION_MARGIN)]
    pub admission_margin: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: defaults::WORKER_COUNT,
            queue_capacity: defaults::QUEUE_CAPACITY,
            batch_size: defaults::FETCH_BATCH_SIZE,
            backoff_ms: defaults::FETCH_BACKOFF_MS,
            max_age_secs: None,
            max_elements: defaults::MAX_ELEMENTS,
            admission_margin: defaults::ADMISSION_MARGIN,
        }
    }
}

impl PipelineConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn max_age(&self) -> Option<chrono::Duration> {
        self.max_age_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .map(chrono::Duration::seconds)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.workers > 0, "workers must be positive");
        ensure!(self.queue_capacity > 0, "queue-capacity must be positive");
        ensure!(self.batch_size > 0, "batch-size must be positive");
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
pub struct ServerConfig {
    #[arg(long, env = "LISTEN_ADDR", default_value = defaults::LISTEN_ADDR)]
    pub listen: String,

    /// Stop serving and exit after this many seconds (disabled when unset)
    #[arg(long, env = "RUN_FOR_SECS")]
    pub run_for_secs: Option<u64>,

    #[arg(long, env = "QUERY_TIMEOUT_SECS", default_value_t = defaults::QUERY_TIMEOUT_SECS)]
    pub query_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: defaults::LISTEN_ADDR.to_string(),
            run_for_secs: None,
            query_timeout_secs: defaults::QUERY_TIMEOUT_SECS,
        }
    }
}

impl ServerConfig {
    pub fn run_for(&self) -> Option<Duration> {
        self.run_for_secs.map(Duration::from_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.query_timeout_secs > 0, "query-timeout-secs must be positive");
        ensure!(self.run_for_secs != Some(0), "run-for-secs must be positive when set");
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
pub struct Config {
    #[command(flatten)]
    pub index: IndexConfig,

    #[command(flatten)]
    pub pipeline: PipelineConfig,

    #[command(flatten)]
    pub server: ServerConfig,

    /// SQLite database holding the `documents` table
    #[arg(long, env = "DOCUMENTS_DB", default_value = "documents.db")]
    pub database: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            index: IndexConfig::default(),
            pipeline: PipelineConfig::default(),
            server: ServerConfig::default(),
            database: PathBuf::from("documents.db"),
        }
    }
}

impl Config {
    /// Validates every section and copies the capacity settings the pipeline
    /// needs for admission control.
    pub fn validated(mut self) -> Result<Self> {
        self.index.validate()?;
        self.pipeline.validate()?;
        self.server.validate()?;
        self.pipeline.max_elements = self.index.max_elements;
        self.pipeline.admission_margin = self.index.admission_margin;
        Ok(self)
    }
}
