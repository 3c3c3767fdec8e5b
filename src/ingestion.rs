//! Tabular source parsing and the bulk ingestion pipeline.
//!
//! A source is checked once for the required columns before any row is
//! touched. After that, rows are independent: a row that cannot be geocoded or
//! that the store rejects is skipped and reported, and the batch carries on.

use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use crate::db::{now_timestamp, Store};
use crate::errors::{AppError, AppResult};
use crate::geocode::{GeoPoint, GeocodeResolver, LocationQuery, ResolutionSource};
use crate::records::{insert_record, DatasetPartition, LinkGroup, Record};

pub const REQUIRED_COLUMNS: [&str; 26] = [
    "AOSNUMBER",
    "City",
    "County",
    "State",
    "Agency",
    "Type of LEA",
    "Summary",
    "Type of Juris",
    "Technology",
    "Vendor",
    "Link 1",
    "Link 1 Snapshot",
    "Link 1 Source",
    "Link 1 Type",
    "Link 1 Date",
    "Link 2",
    "Link 2 Snapshot",
    "Link 2 Source",
    "Link 2 Type",
    "Link 2 Date",
    "Link 3",
    "Link 3 Snapshot",
    "Link 3 Source",
    "Link 3 Type",
    "Link 3 Date",
    "Other Links",
];

/// Alternate header names accepted in place of a canonical column.
const COLUMN_ALIASES: [(&str, &str); 1] = [("Technology Type", "Technology")];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Csv,
    Json,
}

impl SourceFormat {
    pub fn from_file_name(name: &str) -> Option<Self> {
        let extension = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "csv" => Some(SourceFormat::Csv),
            "json" => Some(SourceFormat::Json),
            _ => None,
        }
    }
}

/// Raw bytes of a dataset plus how to read them.
#[derive(Debug, Clone)]
pub struct TabularSource {
    pub name: String,
    pub format: SourceFormat,
    pub bytes: Vec<u8>,
}

impl TabularSource {
    pub fn new(name: impl Into<String>, format: SourceFormat, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            format,
            bytes,
        }
    }

    pub fn from_path(path: &Path) -> AppResult<Self> {
        let name = path.to_string_lossy().to_string();
        let format = SourceFormat::from_file_name(&name)
            .ok_or_else(|| AppError::Parse(format!("unsupported dataset file type: {name}")))?;
        let bytes = std::fs::read(path)?;
        Ok(Self::new(name, format, bytes))
    }

    pub fn parse(&self) -> AppResult<Table> {
        match self.format {
            SourceFormat::Csv => Table::from_csv(&self.bytes),
            SourceFormat::Json => Table::from_json(&self.bytes),
        }
    }

    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.bytes);
        STANDARD_NO_PAD.encode(hasher.finalize())
    }
}

/// Header row plus cells. CSV cells are strings or null; JSON cells keep
/// their original type.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn from_csv(bytes: &[u8]) -> AppResult<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::Headers)
            .from_reader(bytes);
        let headers = reader
            .headers()?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').to_string())
            .collect::<Vec<_>>();
        if headers.iter().all(|h| h.is_empty()) {
            return Err(AppError::Parse("source has no header row".into()));
        }

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let row = headers
                .iter()
                .enumerate()
                .map(|(idx, _)| match record.get(idx) {
                    Some(cell) if !cell.trim().is_empty() => Value::String(cell.to_string()),
                    _ => Value::Null,
                })
                .collect();
            rows.push(row);
        }
        Ok(Self { headers, rows })
    }

    pub fn from_json(bytes: &[u8]) -> AppResult<Self> {
        let parsed: Value = serde_json::from_slice(bytes)?;
        let Value::Array(items) = parsed else {
            return Err(AppError::Parse(
                "JSON source must be an array of row objects".into(),
            ));
        };

        let mut objects = Vec::with_capacity(items.len());
        let mut headers: Vec<String> = Vec::new();
        for item in items {
            let Value::Object(object) = item else {
                return Err(AppError::Parse(
                    "JSON source must be an array of row objects".into(),
                ));
            };
            for key in object.keys() {
                if !headers.iter().any(|h| h == key) {
                    headers.push(key.clone());
                }
            }
            objects.push(object);
        }

        let rows = objects
            .into_iter()
            .map(|mut object| {
                headers
                    .iter()
                    .map(|h| object.remove(h).unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        Ok(Self { headers, rows })
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name).or_else(|| {
            COLUMN_ALIASES
                .iter()
                .filter(|(_, canonical)| *canonical == name)
                .find_map(|(alias, _)| self.headers.iter().position(|h| h == alias))
        })
    }

    pub fn ensure_columns(&self, required: &[&str]) -> AppResult<()> {
        match required.iter().find(|col| self.column_index(col).is_none()) {
            Some(missing) => Err(AppError::Schema((*missing).to_string())),
            None => Ok(()),
        }
    }

    pub fn to_objects(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.headers
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect::<Map<String, Value>>()
            })
            .collect()
    }

    fn text(&self, row: &[Value], column: &str) -> Option<String> {
        let idx = self.column_index(column)?;
        cell_text(row.get(idx)?)
    }
}

fn cell_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    };
    (!text.is_empty()).then_some(text)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    EmptyLocation,
    Unresolved,
    StoreRejected(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedRow {
    /// 1-based position among data rows.
    pub row_number: usize,
    pub city: String,
    pub state: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub source_name: String,
    pub dataset: DatasetPartition,
    pub total_rows: usize,
    pub stored_rows: usize,
    pub skipped: Vec<SkippedRow>,
    pub cache_hits: usize,
    pub live_lookups: usize,
    pub fallbacks: usize,
}

impl IngestionReport {
    fn new(source: &TabularSource, dataset: DatasetPartition, total_rows: usize) -> Self {
        Self {
            source_name: source.name.clone(),
            dataset,
            total_rows,
            stored_rows: 0,
            skipped: Vec::new(),
            cache_hits: 0,
            live_lookups: 0,
            fallbacks: 0,
        }
    }

    pub fn skipped_rows(&self) -> usize {
        self.skipped.len()
    }
}

pub struct IngestionPipeline {
    store: Store,
    resolver: Arc<GeocodeResolver>,
    guard: AsyncMutex<()>,
}

impl IngestionPipeline {
    pub fn new(store: Store, resolver: Arc<GeocodeResolver>) -> Self {
        Self {
            store,
            resolver,
            guard: AsyncMutex::new(()),
        }
    }

    pub async fn ingest_file(
        &self,
        path: &Path,
        dataset: DatasetPartition,
    ) -> AppResult<IngestionReport> {
        let source = TabularSource::from_path(path)?;
        self.ingest(&source, dataset).await
    }

    pub async fn ingest(
        &self,
        source: &TabularSource,
        dataset: DatasetPartition,
    ) -> AppResult<IngestionReport> {
        let _lock = self.guard.lock().await;
        let table = source.parse().map_err(|err| {
            error!(target: "ingestion", source = %source.name, %err, "failed to read source");
            err
        })?;
        table.ensure_columns(&REQUIRED_COLUMNS).map_err(|err| {
            error!(target: "ingestion", source = %source.name, %err, "source rejected");
            err
        })?;

        let mut report = IngestionReport::new(source, dataset, table.rows.len());
        for (idx, row) in table.rows.iter().enumerate() {
            let row_number = idx + 1;
            let query = LocationQuery::new(
                &table.text(row, "City").unwrap_or_default(),
                &table.text(row, "State").unwrap_or_default(),
            );
            if query.is_empty() {
                warn!(target: "ingestion", row_number, "row has no city or state; skipping");
                report.skipped.push(skipped(row_number, &query, SkipReason::EmptyLocation));
                continue;
            }

            let resolution = self.resolver.resolve_query(query).await;
            match resolution.source {
                ResolutionSource::Cache => report.cache_hits += 1,
                ResolutionSource::Live => report.live_lookups += 1,
                ResolutionSource::Fallback => report.fallbacks += 1,
                ResolutionSource::Unresolved => {}
            }
            let Some(point) = resolution.point else {
                warn!(
                    target: "ingestion",
                    row_number,
                    city = resolution.query.city(),
                    state = resolution.query.state(),
                    "failed to geocode; skipping row"
                );
                report
                    .skipped
                    .push(skipped(row_number, &resolution.query, SkipReason::Unresolved));
                continue;
            };

            let record = build_record(&table, row, &resolution.query, dataset, point);
            let inserted = {
                let conn = self.store.lock();
                insert_record(&conn, &record)
            };
            match inserted {
                Ok(_) => report.stored_rows += 1,
                Err(err) => {
                    error!(
                        target: "ingestion",
                        row_number,
                        city = %record.city,
                        state = %record.state,
                        %err,
                        "database insertion error; skipping row"
                    );
                    report.skipped.push(skipped(
                        row_number,
                        &resolution.query,
                        SkipReason::StoreRejected(err.to_string()),
                    ));
                }
            }
        }

        if let Err(err) = self.record_run(source, &report) {
            warn!(target: "ingestion", ?err, "failed to record ingestion run");
        }
        info!(
            target: "ingestion",
            source = %source.name,
            dataset = dataset.as_tag(),
            total = report.total_rows,
            stored = report.stored_rows,
            skipped = report.skipped_rows(),
            cache_hits = report.cache_hits,
            live_lookups = report.live_lookups,
            fallbacks = report.fallbacks,
            "ingestion finished"
        );
        Ok(report)
    }

    fn record_run(&self, source: &TabularSource, report: &IngestionReport) -> AppResult<()> {
        let conn = self.store.lock();
        conn.execute(
            "INSERT INTO ingestion_runs
                (source_name, source_digest, dataset, total_rows, stored_rows, skipped_rows, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            (
                source.name.as_str(),
                source.digest(),
                report.dataset.as_tag(),
                report.total_rows as i64,
                report.stored_rows as i64,
                report.skipped_rows() as i64,
                now_timestamp(),
            ),
        )?;
        Ok(())
    }
}

fn skipped(row_number: usize, query: &LocationQuery, reason: SkipReason) -> SkippedRow {
    SkippedRow {
        row_number,
        city: query.city().to_string(),
        state: query.state().to_string(),
        reason,
    }
}

fn build_record(
    table: &Table,
    row: &[Value],
    query: &LocationQuery,
    dataset: DatasetPartition,
    location: GeoPoint,
) -> Record {
    let text = |column: &str| table.text(row, column);
    let link = |n: u8| LinkGroup {
        url: text(&format!("Link {n}")),
        snapshot: text(&format!("Link {n} Snapshot")),
        source: text(&format!("Link {n} Source")),
        link_type: text(&format!("Link {n} Type")),
        date: text(&format!("Link {n} Date")),
    };
    Record {
        aos_number: text("AOSNUMBER"),
        city: query.city().to_string(),
        county: text("County"),
        state: query.state().to_string(),
        agency: text("Agency"),
        type_of_lea: text("Type of LEA"),
        summary: text("Summary"),
        type_of_juris: text("Type of Juris"),
        technology: text("Technology"),
        vendor: text("Vendor"),
        links: [link(1), link(2), link(3)],
        other_links: text("Other Links"),
        dataset,
        location,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::geocode::tests::{fast_policy, ScriptedProvider};
    use crate::geocode::{FallbackTable, ProviderError};
    use crate::records::count_records;

    fn header_line() -> String {
        REQUIRED_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn csv_row(aos: &str, city: &str, county: &str, state: &str) -> String {
        let mut cells = vec![
            aos.to_string(),
            city.to_string(),
            county.to_string(),
            state.to_string(),
            "Police Department".into(),
            "Police".into(),
            "\"Uses ALPR, citywide\"".into(),
            "Municipal".into(),
            "Automated License Plate Readers".into(),
            "Flock Safety".into(),
            "https://example.org/1".into(),
        ];
        cells.resize(REQUIRED_COLUMNS.len(), String::new());
        cells.join(",")
    }

    fn csv_source(rows: &[String]) -> TabularSource {
        let mut text = header_line();
        for row in rows {
            text.push('\n');
            text.push_str(row);
        }
        TabularSource::new("test.csv", SourceFormat::Csv, text.into_bytes())
    }

    /// Resolves every city except those named "Nowhere".
    fn known_cities(query: &LocationQuery) -> Result<Option<GeoPoint>, ProviderError> {
        match query.city() {
            "Nowhere" => Err(ProviderError::Service("no such place".into())),
            _ => Ok(Some(GeoPoint::new(37.5, -78.0))),
        }
    }

    fn pipeline_with(
        store: Store,
        provider: Arc<ScriptedProvider>,
        fallback: FallbackTable,
    ) -> IngestionPipeline {
        let resolver = GeocodeResolver::new(store.clone(), provider, fast_policy(), fallback);
        IngestionPipeline::new(store, Arc::new(resolver))
    }

    #[tokio::test]
    async fn stores_resolved_rows_and_skips_failures() {
        let store = Store::in_memory().unwrap();
        let provider = Arc::new(ScriptedProvider::always(known_cities));
        let pipeline = pipeline_with(store.clone(), provider.clone(), FallbackTable::empty());

        let source = csv_source(&[
            csv_row("1", "Richmond", "Henrico", "VA"),
            csv_row("2", "Nowhere", "", "MO"),
            csv_row("3", "<b>Richmond</b>", "", "VA"),
            csv_row("4", "Nowhere", "", "KS"),
            csv_row("5", "", "", ""),
        ]);
        let report = pipeline.ingest(&source, DatasetPartition::Atlas).await.unwrap();

        assert_eq!(report.total_rows, 5);
        assert_eq!(report.stored_rows, 2);
        assert_eq!(report.skipped_rows(), 3);
        assert_eq!(report.cache_hits, 1);
        assert_eq!(report.live_lookups, 1);
        assert_eq!(report.skipped[0].row_number, 2);
        assert_eq!(report.skipped[0].reason, SkipReason::Unresolved);
        assert_eq!(report.skipped[2].reason, SkipReason::EmptyLocation);
        assert_eq!(count_records(&store.lock()).unwrap(), 2);
        assert_eq!(provider.calls(), 3);

        let (city, county, summary): (String, Option<String>, Option<String>) = store
            .lock()
            .query_row(
                "SELECT city, county, summary FROM police_data WHERE aos_number = '3'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(city, "Richmond");
        assert!(county.is_none(), "missing optional fields are stored as NULL");
        assert_eq!(summary.as_deref(), Some("Uses ALPR, citywide"));
    }

    #[tokio::test]
    async fn store_rejections_do_not_abort_the_batch() {
        let store = Store::in_memory().unwrap();
        store
            .lock()
            .execute_batch(
                "CREATE TRIGGER reject_blocked BEFORE INSERT ON police_data
                WHEN NEW.city = 'Blocked'
                BEGIN SELECT RAISE(ABORT, 'blocked city'); END;",
            )
            .unwrap();
        let provider = Arc::new(ScriptedProvider::always(known_cities));
        let pipeline = pipeline_with(store.clone(), provider, FallbackTable::empty());

        let source = csv_source(&[
            csv_row("1", "Blocked", "", "AK"),
            csv_row("2", "Norfolk", "", "VA"),
        ]);
        let report = pipeline.ingest(&source, DatasetPartition::Atlas).await.unwrap();
        assert_eq!(report.stored_rows, 1);
        assert!(matches!(
            report.skipped[0].reason,
            SkipReason::StoreRejected(ref message) if message.contains("blocked city")
        ));
        assert_eq!(count_records(&store.lock()).unwrap(), 1);
    }

    #[tokio::test]
    async fn bad_provider_coordinates_do_not_poison_later_runs() {
        let store = Store::in_memory().unwrap();
        let provider = Arc::new(ScriptedProvider::new(
            vec![Ok(Some(GeoPoint::new(95.0, 10.0)))],
            known_cities,
        ));
        let pipeline = pipeline_with(store.clone(), provider.clone(), FallbackTable::default());
        let source = csv_source(&[csv_row("1", "Anchorage", "", "AK")]);

        let first = pipeline.ingest(&source, DatasetPartition::Atlas).await.unwrap();
        assert_eq!(first.stored_rows, 0);
        assert_eq!(first.skipped[0].reason, SkipReason::Unresolved);

        let second = pipeline.ingest(&source, DatasetPartition::Atlas).await.unwrap();
        assert_eq!(second.stored_rows, 1);
        assert_eq!(second.cache_hits, 0);
        assert_eq!(second.live_lookups, 1);
        assert_eq!(provider.calls(), 2);

        let latitude: f64 = store
            .lock()
            .query_row(
                "SELECT latitude FROM geocode_cache WHERE city = 'Anchorage' AND state = 'AK'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(latitude, 37.5);
    }

    #[tokio::test]
    async fn unresolvable_rows_use_fallback_when_available() {
        let store = Store::in_memory().unwrap();
        let provider = Arc::new(ScriptedProvider::always(|_| Err(ProviderError::TimedOut)));
        let pipeline = pipeline_with(store.clone(), provider.clone(), FallbackTable::default());

        let source = csv_source(&[
            csv_row("1", "Peoria", "", "IL"),
            csv_row("2", "Wichita", "", "KS"),
        ]);
        let report = pipeline.ingest(&source, DatasetPartition::Atlas).await.unwrap();
        assert_eq!(report.stored_rows, 1);
        assert_eq!(report.fallbacks, 1);
        assert_eq!(report.skipped[0].state, "KS");
        assert_eq!(provider.calls(), 6);

        let (lat, lng): (f64, f64) = store
            .lock()
            .query_row(
                "SELECT latitude, longitude FROM police_data WHERE state = 'IL'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!((lat, lng), (40.0623, -89.3985));
    }

    #[tokio::test]
    async fn missing_required_column_fails_before_any_row() {
        let store = Store::in_memory().unwrap();
        let provider = Arc::new(ScriptedProvider::always(known_cities));
        let pipeline = pipeline_with(store.clone(), provider.clone(), FallbackTable::default());

        let header = REQUIRED_COLUMNS
            .iter()
            .filter(|c| **c != "Vendor")
            .copied()
            .collect::<Vec<_>>()
            .join(",");
        let text = format!("{header}\n1,Richmond,Henrico,VA");
        let source = TabularSource::new("bad.csv", SourceFormat::Csv, text.into_bytes());

        let err = pipeline
            .ingest(&source, DatasetPartition::Atlas)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Schema(ref column) if column == "Vendor"));
        assert_eq!(provider.calls(), 0);
        assert_eq!(count_records(&store.lock()).unwrap(), 0);
        let runs: i64 = store
            .lock()
            .query_row("SELECT COUNT(*) FROM ingestion_runs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(runs, 0);
    }

    #[tokio::test]
    async fn unparseable_source_fails_the_call() {
        let store = Store::in_memory().unwrap();
        let provider = Arc::new(ScriptedProvider::always(known_cities));
        let pipeline = pipeline_with(store, provider, FallbackTable::default());
        let source = TabularSource::new("broken.json", SourceFormat::Json, b"{not json".to_vec());
        assert!(pipeline.ingest(&source, DatasetPartition::Atlas).await.is_err());
    }

    #[tokio::test]
    async fn ingests_json_sources_and_records_the_run() {
        let store = Store::in_memory().unwrap();
        let provider = Arc::new(ScriptedProvider::always(known_cities));
        let pipeline = pipeline_with(store.clone(), provider, FallbackTable::empty());

        let mut row = Map::new();
        for column in REQUIRED_COLUMNS {
            row.insert(column.to_string(), Value::Null);
        }
        row.insert("AOSNUMBER".into(), json!(42));
        row.insert("City".into(), json!("Laredo"));
        row.insert("State".into(), json!("TX"));
        row.remove("Technology");
        row.insert("Technology Type".into(), json!("Surveillance Towers"));
        let bytes = serde_json::to_vec(&Value::Array(vec![Value::Object(row)])).unwrap();
        let source = TabularSource::new("border.json", SourceFormat::Json, bytes);

        let report = pipeline.ingest(&source, DatasetPartition::Border).await.unwrap();
        assert_eq!(report.stored_rows, 1);

        let conn = store.lock();
        let (aos, technology, dataset): (String, String, String) = conn
            .query_row(
                "SELECT aos_number, technology, dataset FROM police_data",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(aos, "42");
        assert_eq!(technology, "Surveillance Towers");
        assert_eq!(dataset, "border");
        let (digest, stored): (String, i64) = conn
            .query_row(
                "SELECT source_digest, stored_rows FROM ingestion_runs",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(digest, source.digest());
        assert_eq!(stored, 1);
    }

    #[tokio::test]
    async fn ingests_from_a_file_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seed.csv");
        let text = format!("{}\n{}", header_line(), csv_row("1", "Richmond", "", "VA"));
        std::fs::write(&path, text).unwrap();

        let store = Store::in_memory().unwrap();
        let provider = Arc::new(ScriptedProvider::always(known_cities));
        let pipeline = pipeline_with(store, provider, FallbackTable::empty());
        let report = pipeline
            .ingest_file(&path, DatasetPartition::Atlas)
            .await
            .unwrap();
        assert_eq!(report.stored_rows, 1);

        let unsupported = dir.path().join("seed.xlsx");
        std::fs::write(&unsupported, b"binary").unwrap();
        assert!(pipeline
            .ingest_file(&unsupported, DatasetPartition::Atlas)
            .await
            .is_err());
    }

    #[test]
    fn parses_csv_and_json_tables() {
        let csv = Table::from_csv(b"City,State\nRichmond,VA\nPeoria,\n").unwrap();
        assert_eq!(csv.headers, vec!["City", "State"]);
        assert_eq!(csv.rows[1][1], Value::Null);
        let objects = csv.to_objects();
        assert_eq!(objects[0]["City"], json!("Richmond"));

        let json = Table::from_json(br#"[{"City":"Richmond","Count":3},{"State":"VA"}]"#).unwrap();
        assert_eq!(json.headers.len(), 3);
        assert_eq!(json.rows[1][0], Value::Null);
        assert!(Table::from_json(br#"{"City":"Richmond"}"#).is_err());
        assert_eq!(
            SourceFormat::from_file_name("Data.JSON"),
            Some(SourceFormat::Json)
        );
        assert_eq!(SourceFormat::from_file_name("notes.txt"), None);
    }

    #[tokio::test]
    async fn waits_for_the_running_batch() {
        let store = Store::in_memory().unwrap();
        let provider = Arc::new(ScriptedProvider::always(known_cities));
        let pipeline = Arc::new(pipeline_with(store.clone(), provider, FallbackTable::empty()));
        let source = csv_source(&[csv_row("1", "Richmond", "", "VA")]);

        let first = {
            let pipeline = pipeline.clone();
            let source = source.clone();
            tokio::spawn(async move { pipeline.ingest(&source, DatasetPartition::Atlas).await })
        };
        let second = pipeline.ingest(&source, DatasetPartition::Atlas).await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), first)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(first.stored_rows + second.stored_rows, 2);
        assert_eq!(count_records(&store.lock()).unwrap(), 2);
    }
}
