#![allow(dead_code)]

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use gl_search::data::{SampleConfig, SampleData, generate_sample};
use gl_search::domain::{CoverageCheck, DataSource, EstimateConfig, OffsetField, PointData, PointId, SearchMode};
use gl_search::io::ingest::max_offset_pairs;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn at(day: u32, hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2020, 1, day)
        .and_then(|d| d.and_hms_opt(hour, 0, 0))
        .expect("valid test timestamp")
}

/// A point with one offset field whose tide heights span `tides`.
pub fn single_offset_point(lon: f64, tides: (f64, f64)) -> PointData {
    let offsets = vec![OffsetField {
        source: DataSource::Csk,
        master_time: at(1, 0),
        slave_time: at(2, 6),
        offset: 0.42,
        sigma: 0.05,
        projection: [0.6, -0.1, 0.79],
        tide_master: tides.0,
        tide_slave: tides.1,
    }];
    PointData {
        id: PointId::new(lon, -78.0),
        max_offset_pairs: max_offset_pairs(&offsets),
        dem_factors: vec![f64::NAN],
        offsets,
    }
}

/// A synthetic single-point data set with a known grounding level.
pub fn synthetic(n_lon: usize, n_lat: usize, grounding_level: f64) -> SampleData {
    generate_sample(&SampleConfig {
        n_lon,
        n_lat,
        grounding_level,
        ..SampleConfig::default()
    })
    .expect("synthetic sample")
}

pub fn config(mode: SearchMode) -> EstimateConfig {
    EstimateConfig {
        mode,
        coverage: CoverageCheck::All,
        ..EstimateConfig::default()
    }
}

pub fn manual(values: &[f64]) -> EstimateConfig {
    config(SearchMode::Manual {
        values: values.to_vec(),
    })
}

pub fn external(values: &[(PointId, f64)]) -> EstimateConfig {
    config(SearchMode::External {
        values: values.iter().copied().collect::<BTreeMap<_, _>>(),
    })
}
