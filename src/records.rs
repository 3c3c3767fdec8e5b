use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};
use crate::geocode::GeoPoint;

const BBOX_FORMAT_HINT: &str = "Invalid bounding box format. Use min_lng,min_lat,max_lng,max_lat";

/// Dataset a record was ingested from. Both partitions share one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetPartition {
    Atlas,
    Border,
}

impl DatasetPartition {
    pub const ALL: [DatasetPartition; 2] = [DatasetPartition::Atlas, DatasetPartition::Border];

    pub fn as_tag(&self) -> &'static str {
        match self {
            DatasetPartition::Atlas => "atlas",
            DatasetPartition::Border => "border",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "atlas" => Ok(DatasetPartition::Atlas),
            "border" => Ok(DatasetPartition::Border),
            _ => Err(AppError::Config(format!("invalid dataset partition: {value}"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LinkGroup {
    pub url: Option<String>,
    pub snapshot: Option<String>,
    pub source: Option<String>,
    pub link_type: Option<String>,
    pub date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub aos_number: Option<String>,
    pub city: String,
    pub county: Option<String>,
    pub state: String,
    pub agency: Option<String>,
    pub type_of_lea: Option<String>,
    pub summary: Option<String>,
    pub type_of_juris: Option<String>,
    pub technology: Option<String>,
    pub vendor: Option<String>,
    pub links: [LinkGroup; 3],
    pub other_links: Option<String>,
    pub dataset: DatasetPartition,
    pub location: GeoPoint,
}

pub fn insert_record(conn: &Connection, record: &Record) -> AppResult<i64> {
    let [link1, link2, link3] = &record.links;
    conn.execute(
        "INSERT INTO police_data (
            aos_number, city, county, state, agency, type_of_lea, summary,
            type_of_juris, technology, vendor, link1, link1_snapshot,
            link1_source, link1_type, link1_date, link2, link2_snapshot,
            link2_source, link2_type, link2_date, link3, link3_snapshot,
            link3_source, link3_type, link3_date, other_links, dataset,
            latitude, longitude
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
            ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29
        )",
        params![
            record.aos_number,
            record.city,
            record.county,
            record.state,
            record.agency,
            record.type_of_lea,
            record.summary,
            record.type_of_juris,
            record.technology,
            record.vendor,
            link1.url,
            link1.snapshot,
            link1.source,
            link1.link_type,
            link1.date,
            link2.url,
            link2.snapshot,
            link2.source,
            link2.link_type,
            link2.date,
            link3.url,
            link3.snapshot,
            link3.source,
            link3.link_type,
            link3.date,
            record.other_links,
            record.dataset.as_tag(),
            record.location.latitude,
            record.location.longitude,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn count_records(conn: &Connection) -> AppResult<usize> {
    conn.query_row("SELECT COUNT(*) FROM police_data", [], |row| row.get::<_, i64>(0))
        .map(|value| value as usize)
        .map_err(AppError::from)
}

/// Inclusive longitude/latitude rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lng: f64,
    pub min_lat: f64,
    pub max_lng: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    /// Parses `min_lng,min_lat,max_lng,max_lat`.
    pub fn parse(value: &str) -> AppResult<Self> {
        let parts = value
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| AppError::Parse(BBOX_FORMAT_HINT.into()))?;
        let &[min_lng, min_lat, max_lng, max_lat] = parts.as_slice() else {
            return Err(AppError::Parse(BBOX_FORMAT_HINT.into()));
        };
        if parts.iter().any(|v| !v.is_finite()) {
            return Err(AppError::Parse(
                "Bounding box values must be finite numbers".into(),
            ));
        }
        let lng_range = -180.0..=180.0;
        let lat_range = -90.0..=90.0;
        if ![min_lng, max_lng].iter().all(|v| lng_range.contains(v))
            || ![min_lat, max_lat].iter().all(|v| lat_range.contains(v))
        {
            return Err(AppError::Parse(
                "Bounding box is outside valid longitude/latitude ranges".into(),
            ));
        }
        if min_lng > max_lng || min_lat > max_lat {
            return Err(AppError::Parse(
                "Bounding box minimums must not exceed maximums".into(),
            ));
        }
        Ok(Self {
            min_lng,
            min_lat,
            max_lng,
            max_lat,
        })
    }
}

/// Projection of a record served to the map.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapPoint {
    pub lat: f64,
    pub lng: f64,
    pub city: Option<String>,
    pub state: Option<String>,
    pub agency: Option<String>,
    pub technology: Option<String>,
    pub vendor: Option<String>,
}

pub fn records_in_bbox(conn: &Connection, bbox: &BoundingBox) -> AppResult<Vec<MapPoint>> {
    let mut stmt = conn.prepare(
        "SELECT latitude, longitude, city, state, agency, technology, vendor
        FROM police_data
        WHERE longitude BETWEEN ?1 AND ?2
          AND latitude BETWEEN ?3 AND ?4
        ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(
            (bbox.min_lng, bbox.max_lng, bbox.min_lat, bbox.max_lat),
            parse_map_point,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn parse_map_point(row: &Row<'_>) -> rusqlite::Result<MapPoint> {
    Ok(MapPoint {
        lat: row.get(0)?,
        lng: row.get(1)?,
        city: row.get(2)?,
        state: row.get(3)?,
        agency: row.get(4)?,
        technology: row.get(5)?,
        vendor: row.get(6)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::Store;

    pub(crate) fn sample_record(city: &str, state: &str, point: GeoPoint) -> Record {
        Record {
            aos_number: Some("AOS-1".into()),
            city: city.into(),
            county: None,
            state: state.into(),
            agency: Some(format!("{city} Police Department")),
            type_of_lea: Some("Police".into()),
            summary: None,
            type_of_juris: Some("Municipal".into()),
            technology: Some("Automated License Plate Readers".into()),
            vendor: Some("Flock Safety".into()),
            links: Default::default(),
            other_links: None,
            dataset: DatasetPartition::Atlas,
            location: point,
        }
    }

    #[test]
    fn parses_bounding_boxes() {
        let bbox = BoundingBox::parse("-80, 35,-75,40").unwrap();
        assert_eq!(bbox.min_lng, -80.0);
        assert_eq!(bbox.max_lat, 40.0);
        assert!(BoundingBox::parse("").is_err());
        assert!(BoundingBox::parse("1,2,3").is_err());
        assert!(BoundingBox::parse("1,2,3,4,5").is_err());
        assert!(BoundingBox::parse("a,2,3,4").is_err());
        assert!(BoundingBox::parse("NaN,2,3,4").is_err());
        assert!(BoundingBox::parse("10,2,3,4").is_err());
        assert!(BoundingBox::parse("-190,2,3,4").is_err());
        assert!(BoundingBox::parse("-180,-90,180,90").is_ok());
    }

    #[test]
    fn filters_records_inside_the_box() {
        let store = Store::in_memory().unwrap();
        let conn = store.lock();
        insert_record(&conn, &sample_record("Richmond", "VA", GeoPoint::new(37.5, -78.0))).unwrap();
        insert_record(&conn, &sample_record("Peoria", "IL", GeoPoint::new(41.0, -90.0))).unwrap();
        insert_record(&conn, &sample_record("Edge", "VA", GeoPoint::new(40.0, -75.0))).unwrap();

        let bbox = BoundingBox::parse("-80,35,-75,40").unwrap();
        let points = records_in_bbox(&conn, &bbox).unwrap();
        let cities: Vec<_> = points.iter().filter_map(|p| p.city.as_deref()).collect();
        assert_eq!(cities, vec!["Richmond", "Edge"]);
        for point in &points {
            assert!((-80.0..=-75.0).contains(&point.lng));
            assert!((35.0..=40.0).contains(&point.lat));
        }
        assert_eq!(count_records(&conn).unwrap(), 3);
    }

    #[test]
    fn stores_partition_tag_and_nullable_fields() {
        let store = Store::in_memory().unwrap();
        let conn = store.lock();
        let mut record = sample_record("Laredo", "TX", GeoPoint::new(27.5, -99.5));
        record.dataset = DatasetPartition::Border;
        let id = insert_record(&conn, &record).unwrap();
        let (dataset, county): (String, Option<String>) = conn
            .query_row(
                "SELECT dataset, county FROM police_data WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(dataset, "border");
        assert!(county.is_none());
        assert_eq!(DatasetPartition::parse(" Border ").unwrap(), DatasetPartition::Border);
        assert!(DatasetPartition::parse("other").is_err());
    }
}
