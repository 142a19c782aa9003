//! CSV ingest of offset fields.
//!
//! Turns a long-format offsets CSV (one row per offset field per point) into
//! per-point [`PointData`] ready for the estimator.
//!
//! Design goals:
//! - **Strict schema** for required columns (clear errors + exit code 2)
//! - **Row-level validation** (skip bad rows, but report what happened)
//! - **Deterministic behavior**: points come out sorted by id, offsets in file order
//! - **Separation of concerns**: no inversion logic here

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use csv::StringRecord;
use log::{debug, warn};

use crate::domain::{DataSource, OffsetField, PointData, PointId};
use crate::error::AppError;

const REQUIRED_COLUMNS: [&str; 12] = [
    "lon",
    "lat",
    "source",
    "master_time",
    "slave_time",
    "offset",
    "sigma",
    "proj_e",
    "proj_n",
    "proj_u",
    "tide_master",
    "tide_slave",
];

/// Summary stats about the offsets actually used.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetStats {
    pub n_points: usize,
    pub n_offsets: usize,
    pub first_epoch: NaiveDateTime,
    pub last_epoch: NaiveDateTime,
}

/// A row-level error encountered during ingest.
#[derive(Debug, Clone, PartialEq)]
pub struct RowError {
    pub line: usize,
    pub message: String,
}

/// Ingest output: per-point data + stats + row errors.
#[derive(Debug, Clone)]
pub struct IngestedOffsets {
    pub points: Vec<PointData>,
    pub stats: DatasetStats,
    pub row_errors: Vec<RowError>,
    pub rows_read: usize,
    pub rows_used: usize,
}

struct OffsetRow {
    id: PointId,
    field: OffsetField,
    dem_factor: f64,
}

/// Load an offsets CSV from disk.
///
/// With `require_dem_factor` the optional `dem_factor` column becomes mandatory.
pub fn load_offsets(path: &Path, require_dem_factor: bool) -> Result<IngestedOffsets, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::config(format!("Failed to open offsets CSV '{}': {e}", path.display())))?;
    read_offsets(file, require_dem_factor)
}

/// Parse offsets CSV content from any reader.
pub fn read_offsets<R: Read>(input: R, require_dem_factor: bool) -> Result<IngestedOffsets, AppError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(input);

    let headers = reader
        .headers()
        .map_err(|e| AppError::config(format!("Failed to read CSV headers: {e}")))?
        .clone();
    let header_map = build_header_map(&headers);
    ensure_required_columns_exist(&header_map, require_dem_factor)?;

    let mut grouped: BTreeMap<PointId, (Vec<OffsetField>, Vec<f64>)> = BTreeMap::new();
    let mut row_errors = Vec::new();
    let mut rows_read = 0usize;
    let mut rows_used = 0usize;

    for (idx, result) in reader.records().enumerate() {
        // +2: records() starts after the header and CSV lines are 1-based.
        let line = idx + 2;
        rows_read += 1;

        let record = match result {
            Ok(r) => r,
            Err(e) => {
                row_errors.push(RowError {
                    line,
                    message: format!("CSV parse error: {e}"),
                });
                continue;
            }
        };

        match parse_row(&record, &header_map) {
            Ok(row) => {
                let entry = grouped.entry(row.id).or_default();
                entry.0.push(row.field);
                entry.1.push(row.dem_factor);
                rows_used += 1;
            }
            Err(message) => row_errors.push(RowError { line, message }),
        }
    }

    if !row_errors.is_empty() {
        warn!("Skipped {} malformed offset row(s)", row_errors.len());
    }
    if rows_used == 0 {
        return Err(AppError::no_data("No valid offset rows remain after validation."));
    }

    let points: Vec<PointData> = grouped
        .into_iter()
        .map(|(id, (offsets, dem_factors))| {
            let max_offset_pairs = max_offset_pairs(&offsets);
            PointData {
                id,
                offsets,
                dem_factors,
                max_offset_pairs,
            }
        })
        .collect();

    let stats = compute_stats(&points).ok_or_else(|| AppError::no_data("No valid offsets remain after validation."))?;
    debug!(
        "Ingested {} offsets over {} points ({} .. {})",
        stats.n_offsets, stats.n_points, stats.first_epoch, stats.last_epoch
    );

    Ok(IngestedOffsets {
        points,
        stats,
        row_errors,
        rows_read,
        rows_used,
    })
}

/// Maximum possible pairs per source: `k(k−1)/2` over that source's distinct epochs.
pub fn max_offset_pairs(offsets: &[OffsetField]) -> BTreeMap<DataSource, usize> {
    let mut epochs: BTreeMap<DataSource, BTreeSet<NaiveDateTime>> = BTreeMap::new();
    for o in offsets {
        let set = epochs.entry(o.source).or_default();
        set.insert(o.master_time);
        set.insert(o.slave_time);
    }
    epochs
        .into_iter()
        .map(|(source, set)| {
            let k = set.len();
            (source, k * k.saturating_sub(1) / 2)
        })
        .collect()
}

fn build_header_map(headers: &StringRecord) -> HashMap<String, usize> {
    headers
        .iter()
        .enumerate()
        .map(|(idx, name)| (normalize_header_name(name), idx))
        .collect()
}

fn normalize_header_name(name: &str) -> String {
    // Spreadsheet exports may prefix the first header with a UTF-8 BOM.
    let name = name.trim().trim_start_matches('\u{feff}');
    name.to_ascii_lowercase()
}

fn ensure_required_columns_exist(header_map: &HashMap<String, usize>, require_dem_factor: bool) -> Result<(), AppError> {
    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|c| !header_map.contains_key(*c))
        .collect();
    if !missing.is_empty() {
        return Err(AppError::config(
            format!("Missing required column(s): {}", missing.join(", ")),
        ));
    }
    if require_dem_factor && !header_map.contains_key("dem_factor") {
        return Err(AppError::config(
            "`topo_residual` is enabled but the offsets CSV has no `dem_factor` column.",
        ));
    }
    Ok(())
}

fn parse_row(record: &StringRecord, header_map: &HashMap<String, usize>) -> Result<OffsetRow, String> {
    let lon = parse_f64(record, header_map, "lon")?;
    let lat = parse_f64(record, header_map, "lat")?;
    let source: DataSource = get_required(record, header_map, "source")?.parse()?;
    let master_time = parse_datetime(get_required(record, header_map, "master_time")?)?;
    let slave_time = parse_datetime(get_required(record, header_map, "slave_time")?)?;

    let offset = parse_f64(record, header_map, "offset")?;
    let sigma = parse_f64(record, header_map, "sigma")?;
    if sigma <= 0.0 {
        return Err(format!("`sigma` must be positive (got {sigma})."));
    }

    let projection = [
        parse_f64(record, header_map, "proj_e")?,
        parse_f64(record, header_map, "proj_n")?,
        parse_f64(record, header_map, "proj_u")?,
    ];
    let tide_master = parse_f64(record, header_map, "tide_master")?;
    let tide_slave = parse_f64(record, header_map, "tide_slave")?;

    let dem_factor = match get_optional(record, header_map, "dem_factor") {
        Some(s) => s
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| format!("Invalid `dem_factor` value '{s}'."))?,
        None => f64::NAN,
    };

    Ok(OffsetRow {
        id: PointId::new(lon, lat),
        field: OffsetField {
            source,
            master_time,
            slave_time,
            offset,
            sigma,
            projection,
            tide_master,
            tide_slave,
        },
        dem_factor,
    })
}

fn compute_stats(points: &[PointData]) -> Option<DatasetStats> {
    let epochs = points
        .iter()
        .flat_map(|p| p.offsets.iter())
        .flat_map(|o| [o.master_time, o.slave_time]);
    let first_epoch = epochs.clone().min()?;
    let last_epoch = epochs.max()?;
    Some(DatasetStats {
        n_points: points.len(),
        n_offsets: points.iter().map(|p| p.offsets.len()).sum(),
        first_epoch,
        last_epoch,
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

fn get_optional<'a>(record: &'a StringRecord, header_map: &HashMap<String, usize>, name: &str) -> Option<&'a str> {
    let idx = header_map.get(name)?;
    record.get(*idx).map(str::trim).filter(|s| !s.is_empty())
}

fn parse_f64(record: &StringRecord, header_map: &HashMap<String, usize>, name: &str) -> Result<f64, String> {
    let s = get_required(record, header_map, name)?;
    match s.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(format!("Invalid `{name}` value '{s}'.")),
    }
}

fn parse_datetime(s: &str) -> Result<NaiveDateTime, String> {
    const FMTS: [&str; 5] = [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y%m%dT%H%M%S",
    ];
    for fmt in FMTS {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(t);
        }
    }
    // A bare date means midnight.
    if let Some(t) = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        return Ok(t);
    }
    Err(format!(
        "Invalid timestamp '{s}'. Expected YYYY-MM-DDTHH:MM:SS, YYYY-MM-DD HH:MM:SS or YYYY-MM-DD."
    ))
}
