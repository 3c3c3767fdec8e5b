//! Location resolution: cache, live provider with bounded retries, then a
//! static per-state fallback table.
//!
//! [`GeocodeResolver::resolve`] never fails. Every path ends in a
//! [`Resolution`] whose `point` is `None` when the location could not be
//! determined; callers decide what to do with an unresolved row.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use rusqlite::OptionalExtension;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, trace, warn};

use crate::config::AppConfig;
use crate::db::Store;
use crate::errors::{AppError, AppResult};

static MARKUP_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid tag pattern"));

/// Removes markup tags and surrounding whitespace.
pub fn strip_markup(value: &str) -> String {
    MARKUP_TAG.replace_all(value, "").trim().to_string()
}

/// A normalized `(city, state)` pair. Case is kept as supplied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LocationQuery {
    city: String,
    state: String,
}

impl LocationQuery {
    pub fn new(city: &str, state: &str) -> Self {
        Self {
            city: strip_markup(city),
            state: strip_markup(state),
        }
    }

    pub fn city(&self) -> &str {
        &self.city
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn is_empty(&self) -> bool {
        self.city.is_empty() && self.state.is_empty()
    }

    pub fn search_text(&self, country: &str) -> String {
        [self.city.as_str(), self.state.as_str(), country]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Finite and within WGS84 latitude/longitude bounds.
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Cache,
    Live,
    Fallback,
    Unresolved,
}

impl ResolutionSource {
    fn cache_tag(&self) -> Option<&'static str> {
        match self {
            ResolutionSource::Live => Some("live"),
            ResolutionSource::Fallback => Some("fallback"),
            ResolutionSource::Cache | ResolutionSource::Unresolved => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub query: LocationQuery,
    pub point: Option<GeoPoint>,
    pub source: ResolutionSource,
    pub provider_calls: u32,
}

impl Resolution {
    fn new(
        query: LocationQuery,
        point: Option<GeoPoint>,
        source: ResolutionSource,
        provider_calls: u32,
    ) -> Self {
        Self {
            query,
            point,
            source,
            provider_calls,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.point.is_some()
    }
}

/// Default coordinates per state code, used only when live geocoding fails.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackTable {
    entries: BTreeMap<String, GeoPoint>,
}

impl Default for FallbackTable {
    fn default() -> Self {
        Self::empty()
            .with_entry("VA", GeoPoint::new(37.9268, -78.0205))
            .with_entry("IL", GeoPoint::new(40.0623, -89.3985))
            .with_entry("GA", GeoPoint::new(32.8399, -83.5753))
    }
}

impl FallbackTable {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn with_entry(mut self, state: impl Into<String>, point: GeoPoint) -> Self {
        self.entries.insert(state.into(), point);
        self
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = (String, GeoPoint)>) {
        self.entries.extend(entries);
    }

    pub fn get(&self, state: &str) -> Option<GeoPoint> {
        self.entries.get(state).copied()
    }

    pub fn states(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Parses `STATE=lat,lng` entries separated by `;`.
    pub fn parse_overrides(raw: &str) -> AppResult<Vec<(String, GeoPoint)>> {
        let mut entries = Vec::new();
        for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let invalid = || AppError::Config(format!("invalid fallback entry: {entry}"));
            let (state, coords) = entry.split_once('=').ok_or_else(invalid)?;
            let (lat, lng) = coords.split_once(',').ok_or_else(invalid)?;
            let latitude: f64 = lat.trim().parse().map_err(|_| invalid())?;
            let longitude: f64 = lng.trim().parse().map_err(|_| invalid())?;
            let state = state.trim();
            let point = GeoPoint::new(latitude, longitude);
            if state.is_empty() || !point.is_valid() {
                return Err(invalid());
            }
            entries.push((state.to_string(), point));
        }
        Ok(entries)
    }
}

/// Retry budget and timing for live lookups.
#[derive(Debug, Clone, Copy)]
pub struct ResolverPolicy {
    pub max_attempts: u32,
    pub timeout: Duration,
    pub backoff: Duration,
}

impl Default for ResolverPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_secs(10),
            backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("geocoding request timed out")]
    TimedOut,
    #[error("geocoding service error: {0}")]
    Service(String),
    #[error("geocoding failed: {0}")]
    Other(String),
}

impl ProviderError {
    /// Rate limiting is only reported through the message text.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            ProviderError::Service(message) => message.to_ascii_lowercase().contains("rate limit"),
            _ => false,
        }
    }
}

#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    /// `Ok(None)` means the provider answered but found no match.
    async fn geocode(
        &self,
        query: &LocationQuery,
        timeout: Duration,
    ) -> Result<Option<GeoPoint>, ProviderError>;
}

pub struct GeocodeResolver {
    store: Store,
    provider: Arc<dyn GeocodeProvider>,
    policy: ResolverPolicy,
    fallback: FallbackTable,
    rate_limiter: Option<RateLimiter>,
    memory: Mutex<HashMap<LocationQuery, GeoPoint>>,
}

impl GeocodeResolver {
    pub fn new(
        store: Store,
        provider: Arc<dyn GeocodeProvider>,
        policy: ResolverPolicy,
        fallback: FallbackTable,
    ) -> Self {
        Self {
            store,
            provider,
            policy: ResolverPolicy {
                max_attempts: policy.max_attempts.max(1),
                ..policy
            },
            fallback,
            rate_limiter: None,
            memory: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(store: Store, config: &AppConfig) -> AppResult<Self> {
        let provider = NominatimClient::new(config)?;
        Ok(Self::new(
            store,
            Arc::new(provider),
            config.resolver_policy(),
            config.fallback_table.clone(),
        )
        .with_rate_limit(config.geocoder_rate_limit_qps))
    }

    pub fn with_rate_limit(mut self, qps: u32) -> Self {
        self.rate_limiter = Some(RateLimiter::new(qps));
        self
    }

    pub async fn resolve(&self, city: &str, state: &str) -> Resolution {
        self.resolve_query(LocationQuery::new(city, state)).await
    }

    pub async fn resolve_query(&self, query: LocationQuery) -> Resolution {
        if query.is_empty() {
            return Resolution::new(query, None, ResolutionSource::Unresolved, 0);
        }

        match self.lookup_cache(&query) {
            Ok(Some(point)) => {
                trace!(target: "geocode", city = query.city(), state = query.state(), "cache hit");
                return Resolution::new(query, Some(point), ResolutionSource::Cache, 0);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(target: "geocode", ?err, "cache lookup failed; continuing with live lookup");
            }
        }

        let (live, calls) = self.lookup_with_retry(&query).await;
        if let Some(point) = live {
            self.remember(&query, point, ResolutionSource::Live);
            return Resolution::new(query, Some(point), ResolutionSource::Live, calls);
        }

        if let Some(point) = self.fallback.get(query.state()) {
            warn!(
                target: "geocode",
                city = query.city(),
                state = query.state(),
                latitude = point.latitude,
                longitude = point.longitude,
                "using fallback coordinates"
            );
            self.remember(&query, point, ResolutionSource::Fallback);
            return Resolution::new(query, Some(point), ResolutionSource::Fallback, calls);
        }

        Resolution::new(query, None, ResolutionSource::Unresolved, calls)
    }

    async fn lookup_with_retry(&self, query: &LocationQuery) -> (Option<GeoPoint>, u32) {
        let max_attempts = self.policy.max_attempts;
        let mut attempt = 0;
        while attempt < max_attempts {
            attempt += 1;
            if let Some(limiter) = &self.rate_limiter {
                limiter.wait().await;
            }
            let outcome = match self.provider.geocode(query, self.policy.timeout).await {
                Ok(Some(point)) if !point.is_valid() => Err(ProviderError::Other(format!(
                    "coordinates out of range: {}, {}",
                    point.latitude, point.longitude
                ))),
                other => other,
            };
            match outcome {
                Ok(Some(point)) => return (Some(point), attempt),
                Ok(None) => {
                    debug!(
                        target: "geocode",
                        attempt,
                        city = query.city(),
                        state = query.state(),
                        "no match"
                    );
                }
                Err(ProviderError::TimedOut) => {
                    warn!(
                        target: "geocode",
                        attempt,
                        city = query.city(),
                        state = query.state(),
                        "geocoding timed out; retrying after {:?}",
                        self.policy.backoff
                    );
                    self.back_off(attempt).await;
                }
                Err(err) if err.is_rate_limited() => {
                    warn!(
                        target: "geocode",
                        %err,
                        attempt,
                        city = query.city(),
                        state = query.state(),
                        "rate limited; retrying after {:?}",
                        self.policy.backoff
                    );
                    self.back_off(attempt).await;
                }
                Err(err) => {
                    error!(
                        target: "geocode",
                        %err,
                        city = query.city(),
                        state = query.state(),
                        "geocoding aborted"
                    );
                    return (None, attempt);
                }
            }
        }

        warn!(
            target: "geocode",
            attempts = attempt,
            city = query.city(),
            state = query.state(),
            "geocoding failed after all attempts"
        );
        (None, attempt)
    }

    async fn back_off(&self, attempt: u32) {
        if attempt < self.policy.max_attempts && !self.policy.backoff.is_zero() {
            sleep(self.policy.backoff).await;
        }
    }

    fn lookup_cache(&self, query: &LocationQuery) -> AppResult<Option<GeoPoint>> {
        if let Some(point) = self.memory.lock().get(query).copied() {
            return Ok(Some(point));
        }

        let stored = {
            let conn = self.store.lock();
            let cached = conn
                .query_row(
                    "SELECT latitude, longitude FROM geocode_cache WHERE city = ?1 AND state = ?2",
                    (query.city(), query.state()),
                    |row| Ok(GeoPoint::new(row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            match cached {
                Some(point) => Some(point),
                None => conn
                    .query_row(
                        "SELECT latitude, longitude FROM police_data
                        WHERE city = ?1 AND state = ?2 AND latitude IS NOT NULL
                        ORDER BY id ASC
                        LIMIT 1",
                        (query.city(), query.state()),
                        |row| Ok(GeoPoint::new(row.get(0)?, row.get(1)?)),
                    )
                    .optional()?,
            }
        };

        if let Some(point) = stored {
            self.memory.lock().entry(query.clone()).or_insert(point);
        }
        Ok(stored)
    }

    fn remember(&self, query: &LocationQuery, point: GeoPoint, source: ResolutionSource) {
        let Some(tag) = source.cache_tag() else {
            return;
        };
        if !point.is_valid() {
            return;
        }
        self.memory.lock().entry(query.clone()).or_insert(point);
        let result = self.store.lock().execute(
            "INSERT INTO geocode_cache (city, state, latitude, longitude, source, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, DATETIME('now'))
            ON CONFLICT(city, state) DO NOTHING",
            (
                query.city(),
                query.state(),
                point.latitude,
                point.longitude,
                tag,
            ),
        );
        if let Err(err) = result {
            warn!(
                target: "geocode",
                ?err,
                city = query.city(),
                state = query.state(),
                "failed to cache coordinates"
            );
        }
    }
}

/// Spaces provider calls at least `1 / qps` apart.
struct RateLimiter {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(qps: u32) -> Self {
        let safe_qps = qps.max(1);
        Self {
            min_interval: Duration::from_millis((1000_f64 / safe_qps as f64).ceil() as u64),
            last_tick: AsyncMutex::new(None),
        }
    }

    async fn wait(&self) {
        let interval = self.min_interval;
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

/// Nominatim-compatible free-text search client.
pub struct NominatimClient {
    http: reqwest::Client,
    endpoint: String,
    country: String,
    api_key: Option<SecretString>,
}

#[derive(Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
}

impl NominatimClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.geocoder_user_agent.clone())
            .build()?;
        Ok(Self {
            http,
            endpoint: config.geocoder_endpoint.clone(),
            country: config.geocoder_country.clone(),
            api_key: config.geocoder_api_key.clone(),
        })
    }
}

#[async_trait]
impl GeocodeProvider for NominatimClient {
    async fn geocode(
        &self,
        query: &LocationQuery,
        timeout: Duration,
    ) -> Result<Option<GeoPoint>, ProviderError> {
        let text = query.search_text(&self.country);
        let mut params = vec![
            ("q", text.as_str()),
            ("format", "jsonv2"),
            ("limit", "1"),
        ];
        if let Some(key) = &self.api_key {
            params.push(("key", key.expose_secret()));
        }

        let response = self
            .http
            .get(&self.endpoint)
            .query(&params)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::Service(format!(
                "rate limit exceeded (HTTP {})",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(ProviderError::Service(format!(
                "unexpected HTTP status {}",
                status.as_u16()
            )));
        }

        let places: Vec<NominatimPlace> = response.json().await.map_err(classify_transport_error)?;
        let Some(place) = places.into_iter().next() else {
            return Ok(None);
        };
        let latitude = place.lat.trim().parse::<f64>().map_err(|err| {
            ProviderError::Other(format!("invalid latitude {:?}: {err}", place.lat))
        })?;
        let longitude = place.lon.trim().parse::<f64>().map_err(|err| {
            ProviderError::Other(format!("invalid longitude {:?}: {err}", place.lon))
        })?;
        Ok(Some(GeoPoint::new(latitude, longitude)))
    }
}

fn classify_transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::TimedOut
    } else if err.is_decode() {
        ProviderError::Other(err.to_string())
    } else {
        ProviderError::Service(err.to_string())
    }
}
