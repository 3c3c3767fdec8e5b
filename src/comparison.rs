use std::collections::BTreeMap;

use rusqlite::Connection;
use serde::Serialize;

use crate::errors::AppResult;
use crate::records::DatasetPartition;

const UNKNOWN_TECHNOLOGY: &str = "Unknown";

/// Technology counts per dataset partition, keyed by partition tag.
#[derive(Debug, Serialize, Clone, Default, PartialEq)]
pub struct ComparisonSummary {
    pub tech_distribution: BTreeMap<String, BTreeMap<String, usize>>,
    pub total_agencies: BTreeMap<String, usize>,
}

impl ComparisonSummary {
    pub fn technology_count(&self, partition: DatasetPartition, technology: &str) -> usize {
        self.tech_distribution
            .get(partition.as_tag())
            .and_then(|counts| counts.get(technology))
            .copied()
            .unwrap_or(0)
    }

    pub fn total(&self, partition: DatasetPartition) -> usize {
        self.total_agencies
            .get(partition.as_tag())
            .copied()
            .unwrap_or(0)
    }
}

pub fn compute_summary(conn: &Connection) -> AppResult<ComparisonSummary> {
    let mut summary = ComparisonSummary::default();
    for partition in DatasetPartition::ALL {
        summary
            .tech_distribution
            .insert(partition.as_tag().to_string(), BTreeMap::new());
        summary
            .total_agencies
            .insert(partition.as_tag().to_string(), 0);
    }

    let mut stmt = conn.prepare(
        "SELECT dataset,
                COALESCE(NULLIF(TRIM(technology), ''), ?1) AS technology,
                COUNT(*)
        FROM police_data
        GROUP BY dataset, 2
        ORDER BY dataset, 2",
    )?;
    let rows = stmt.query_map([UNKNOWN_TECHNOLOGY], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;

    for row in rows {
        let (dataset, technology, count) = row?;
        let count = count as usize;
        *summary
            .tech_distribution
            .entry(dataset.clone())
            .or_default()
            .entry(technology)
            .or_default() += count;
        *summary.total_agencies.entry(dataset).or_default() += count;
    }

    Ok(summary)
}
