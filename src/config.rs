use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::{debug, warn};

use crate::geocode::{FallbackTable, ResolverPolicy};

const DEFAULT_GEOCODER_ENDPOINT: &str = "https://nominatim.openstreetmap.org/search";
const DEFAULT_USER_AGENT: &str = "police_tech_app";
const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_MS: u64 = 1_000;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub uploads_dir: PathBuf,
    pub database_file_name: String,
    pub seed_dataset_path: PathBuf,
    pub seed_dataset_partition: String,
    pub bind_addr: String,
    pub geocoder_endpoint: String,
    pub geocoder_user_agent: String,
    pub geocoder_api_key: Option<SecretString>,
    pub geocoder_country: String,
    pub geocoder_timeout_secs: u64,
    pub geocoder_max_attempts: u32,
    pub geocoder_backoff_ms: u64,
    pub geocoder_rate_limit_qps: u32,
    pub fallback_table: FallbackTable,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub database_file_name: String,
    pub seed_dataset_path: String,
    pub seed_dataset_partition: String,
    pub geocoder_endpoint: String,
    pub geocoder_country: String,
    pub geocoder_timeout_secs: u64,
    pub geocoder_max_attempts: u32,
    pub geocoder_backoff_ms: u64,
    pub geocoder_rate_limit_qps: u32,
    pub fallback_states: Vec<String>,
    pub has_geocoder_api_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let data_dir = PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "data".into()));
        let seed_dataset_path = env::var("SEED_DATASET_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("police_tech_data.csv"));
        Self {
            uploads_dir: PathBuf::from(
                env::var("UPLOADS_DIR").unwrap_or_else(|_| "uploads".into()),
            ),
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or_else(|_| "surveillance.db".to_string()),
            seed_dataset_path,
            seed_dataset_partition: env::var("SEED_DATASET_PARTITION")
                .unwrap_or_else(|_| "atlas".to_string()),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string()),
            geocoder_endpoint: env::var("GEOCODER_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_GEOCODER_ENDPOINT.to_string()),
            geocoder_user_agent: env::var("GEOCODER_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            geocoder_api_key: env::var("GEOCODER_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            geocoder_country: env::var("GEOCODER_COUNTRY").unwrap_or_else(|_| "USA".to_string()),
            geocoder_timeout_secs: parse_u64("GEOCODER_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS).max(1),
            geocoder_max_attempts: parse_u32("GEOCODER_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS).max(1),
            geocoder_backoff_ms: parse_u64("GEOCODER_BACKOFF_MS", DEFAULT_BACKOFF_MS),
            geocoder_rate_limit_qps: parse_u32("GEOCODER_RATE_LIMIT_QPS", 1).max(1),
            fallback_table: load_fallback_table(),
            data_dir,
        }
    }

    pub fn resolver_policy(&self) -> ResolverPolicy {
        ResolverPolicy {
            max_attempts: self.geocoder_max_attempts,
            timeout: Duration::from_secs(self.geocoder_timeout_secs),
            backoff: Duration::from_millis(self.geocoder_backoff_ms),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            database_file_name: self.database_file_name.clone(),
            seed_dataset_path: self.seed_dataset_path.to_string_lossy().to_string(),
            seed_dataset_partition: self.seed_dataset_partition.clone(),
            geocoder_endpoint: self.geocoder_endpoint.clone(),
            geocoder_country: self.geocoder_country.clone(),
            geocoder_timeout_secs: self.geocoder_timeout_secs,
            geocoder_max_attempts: self.geocoder_max_attempts,
            geocoder_backoff_ms: self.geocoder_backoff_ms,
            geocoder_rate_limit_qps: self.geocoder_rate_limit_qps,
            fallback_states: self.fallback_table.states(),
            has_geocoder_api_key: self.geocoder_api_key.is_some(),
        }
    }
}

fn load_fallback_table() -> FallbackTable {
    let mut table = FallbackTable::default();
    let Ok(raw) = env::var("GEOCODER_FALLBACKS") else {
        return table;
    };
    match FallbackTable::parse_overrides(&raw) {
        Ok(overrides) => table.extend(overrides),
        Err(err) => warn!(%err, "ignoring malformed GEOCODER_FALLBACKS"),
    }
    table
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}
