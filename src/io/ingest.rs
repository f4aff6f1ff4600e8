//! CSV ingest and normalization of the observation table.
//!
//! This module turns the depth/age-resolved concentration CSV into a clean
//! `ObservationSet` that is safe to fit against.
//!
//! Design goals:
//! - **Strict schema** for required fields (clear errors + exit code 2)
//! - **Row-level validation** with line numbers in messages
//! - **Deterministic behavior** (no hidden normalization)
//! - **Separation of concerns**: no fitting logic here
//!
//! Expected columns: `time`, one concentration column per pool (`pool_1`,
//! `pool_2`, ...; cells may be empty where a pool was not measured), a
//! `horizon_id` label, and a `replicate_kind` in {min, mean, max}. Rows must
//! be sorted ascending by time.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use csv::StringRecord;

use crate::domain::ReplicateKind;
use crate::error::AppError;

/// One validated observation row.
#[derive(Debug, Clone)]
pub struct ObservationRow {
    pub time: f64,
    /// One slot per pool; `None` where the pool was not measured at this row.
    pub concentrations: Vec<Option<f64>>,
    pub horizon: String,
    pub replicate: ReplicateKind,
}

/// Summary stats about the ingested table.
#[derive(Debug, Clone)]
pub struct DatasetStats {
    pub rows: usize,
    pub n_pools: usize,
    pub time_min: f64,
    pub time_max: f64,
}

/// The immutable observation table plus its derived fitting grid.
///
/// `grid` holds the unique ascending observation times; every simulation
/// during the search is sampled on exactly this grid, so each observation is
/// paired with its simulated value by grid index.
#[derive(Debug, Clone)]
pub struct ObservationSet {
    pub n_pools: usize,
    pub grid: Vec<f64>,
    pub rows: Vec<ObservationRow>,
    /// Per pool: (grid index, observed concentration) pairs, row order.
    pool_obs: Vec<Vec<(usize, f64)>>,
}

impl ObservationSet {
    pub fn from_rows(n_pools: usize, rows: Vec<ObservationRow>) -> Result<Self, AppError> {
        if rows.is_empty() {
            return Err(AppError::new(3, "Observation table is empty."));
        }

        let mut grid: Vec<f64> = Vec::new();
        for w in rows.windows(2) {
            if w[1].time < w[0].time {
                return Err(AppError::new(
                    2,
                    format!(
                        "Observations must be sorted ascending by time ({} after {}).",
                        w[1].time, w[0].time
                    ),
                ));
            }
        }
        for row in &rows {
            if grid.last().is_none_or(|&last| row.time > last) {
                grid.push(row.time);
            }
        }

        let mut pool_obs: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n_pools];
        for row in &rows {
            if row.concentrations.len() != n_pools {
                return Err(AppError::new(4, "Observation row width mismatch."));
            }
            let grid_idx = grid
                .binary_search_by(|t| t.partial_cmp(&row.time).unwrap_or(std::cmp::Ordering::Equal))
                .map_err(|_| AppError::new(4, "Observation time missing from grid."))?;
            for (pool, conc) in row.concentrations.iter().enumerate() {
                if let Some(c) = conc {
                    pool_obs[pool].push((grid_idx, *c));
                }
            }
        }

        // Each pool needs enough rows for the regression diagnostic.
        for (pool, obs) in pool_obs.iter().enumerate() {
            if obs.len() < 3 {
                return Err(AppError::new(
                    3,
                    format!(
                        "Pool {} has {} observation(s); at least 3 are required.",
                        pool + 1,
                        obs.len()
                    ),
                ));
            }
        }

        Ok(Self {
            n_pools,
            grid,
            rows,
            pool_obs,
        })
    }

    /// (grid index, observation) pairs for a pool (0-based).
    pub fn pool_observations(&self, pool: usize) -> &[(usize, f64)] {
        &self.pool_obs[pool]
    }

    pub fn stats(&self) -> DatasetStats {
        DatasetStats {
            rows: self.rows.len(),
            n_pools: self.n_pools,
            time_min: *self.grid.first().unwrap_or(&f64::NAN),
            time_max: *self.grid.last().unwrap_or(&f64::NAN),
        }
    }
}

/// Load and validate the observation CSV.
pub fn read_observations(path: &Path) -> Result<ObservationSet, AppError> {
    let file = File::open(path).map_err(|e| {
        AppError::new(2, format!("Failed to open CSV '{}': {e}", path.display()))
    })?;

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file);

    let headers = reader
        .headers()
        .map_err(|e| AppError::new(2, format!("Failed to read CSV headers: {e}")))?
        .clone();
    let header_map = build_header_map(&headers);

    for required in ["time", "horizon_id", "replicate_kind"] {
        if !header_map.contains_key(required) {
            return Err(AppError::new(
                2,
                format!("Missing required column: `{required}`"),
            ));
        }
    }

    let pool_columns = resolve_pool_columns(&header_map)?;
    let n_pools = pool_columns.len();

    let mut rows = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        // records() starts after the header row; CSV lines are 1-based.
        let line = idx + 2;
        let record =
            result.map_err(|e| AppError::new(2, format!("Line {line}: CSV parse error: {e}")))?;

        rows.push(parse_row(&record, &header_map, &pool_columns, line)?);
    }

    ObservationSet::from_rows(n_pools, rows)
}

fn build_header_map(headers: &StringRecord) -> HashMap<String, usize> {
    headers
        .iter()
        .enumerate()
        .map(|(idx, name)| (normalize_header_name(name), idx))
        .collect()
}

fn normalize_header_name(name: &str) -> String {
    // Spreadsheet exports sometimes prefix the first header with a UTF-8 BOM;
    // strip it or schema validation reports a bogus missing column.
    let name = name.trim().trim_start_matches('\u{feff}');
    name.to_ascii_lowercase()
}

/// Find `pool_1..pool_N` columns and require the indices to be dense from 1.
fn resolve_pool_columns(header_map: &HashMap<String, usize>) -> Result<Vec<usize>, AppError> {
    let mut numbered: Vec<(usize, usize)> = Vec::new();
    for (name, &col) in header_map {
        if let Some(suffix) = name.strip_prefix("pool_") {
            let pool: usize = suffix.parse().map_err(|_| {
                AppError::new(2, format!("Invalid pool column name: `{name}`"))
            })?;
            numbered.push((pool, col));
        }
    }
    if numbered.is_empty() {
        return Err(AppError::new(
            2,
            "No pool concentration columns found (expected `pool_1`, `pool_2`, ...).",
        ));
    }
    numbered.sort_by_key(|&(pool, _)| pool);
    for (expected, &(pool, _)) in numbered.iter().enumerate() {
        if pool != expected + 1 {
            return Err(AppError::new(
                2,
                "Pool columns must be numbered densely from `pool_1`.",
            ));
        }
    }
    Ok(numbered.into_iter().map(|(_, col)| col).collect())
}

fn parse_row(
    record: &StringRecord,
    header_map: &HashMap<String, usize>,
    pool_columns: &[usize],
    line: usize,
) -> Result<ObservationRow, AppError> {
    let raw_time = get_required(record, header_map, "time")
        .map_err(|e| AppError::new(2, format!("Line {line}: {e}")))?;
    let time: f64 = raw_time
        .parse()
        .map_err(|_| AppError::new(2, format!("Line {line}: invalid time '{raw_time}'.")))?;
    if !(time.is_finite() && time >= 0.0) {
        return Err(AppError::new(
            2,
            format!("Line {line}: time must be finite and >= 0."),
        ));
    }

    let mut concentrations = Vec::with_capacity(pool_columns.len());
    for (pool, &col) in pool_columns.iter().enumerate() {
        let cell = record.get(col).map(str::trim).filter(|s| !s.is_empty());
        match cell {
            None => concentrations.push(None),
            Some(s) => {
                let v: f64 = s.parse().map_err(|_| {
                    AppError::new(
                        2,
                        format!("Line {line}: invalid pool_{} value '{s}'.", pool + 1),
                    )
                })?;
                if !(v.is_finite() && v >= 0.0) {
                    return Err(AppError::new(
                        2,
                        format!("Line {line}: pool_{} must be finite and >= 0.", pool + 1),
                    ));
                }
                concentrations.push(Some(v));
            }
        }
    }

    let horizon = get_required(record, header_map, "horizon_id")
        .map_err(|e| AppError::new(2, format!("Line {line}: {e}")))?
        .to_string();

    let raw_replicate = get_required(record, header_map, "replicate_kind")
        .map_err(|e| AppError::new(2, format!("Line {line}: {e}")))?;
    let replicate = ReplicateKind::parse(raw_replicate).ok_or_else(|| {
        AppError::new(
            2,
            format!("Line {line}: replicate_kind '{raw_replicate}' is not one of min/mean/max."),
        )
    })?;

    Ok(ObservationRow {
        time,
        concentrations,
        horizon,
        replicate,
    })
}

fn get_required<'a>(
    record: &'a StringRecord,
    header_map: &HashMap<String, usize>,
    name: &str,
) -> Result<&'a str, String> {
    let idx = header_map
        .get(name)
        .ok_or_else(|| format!("Missing required column: `{name}`"))?;
    record
        .get(*idx)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("Missing required value: `{name}`"))
}
