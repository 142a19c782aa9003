//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they can be:
//!
//! - used in-memory during the grounding-level search
//! - persisted to the search checkpoint and resumed later
//! - exported to xyz/CSV/JSON tables for plotting

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Scale used to turn a grounding level (metres) into an exact integer key.
pub const GL_SCALE: f64 = 1e6;

/// Grounding level assigned to points that cannot sit on the floating shelf.
pub const NO_GROUNDING_LEVEL: f64 = -10.0;

/// A grounding-level candidate stored as `round(value × 10^6)`.
///
/// All enumeration bookkeeping (completed sets, likelihood maps, checkpoint keys)
/// goes through this type so that keys are exact, hashable and never NaN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlInt(pub i64);

impl GlInt {
    /// The "no grounding" sentinel (`-10.0` m).
    pub const SENTINEL: GlInt = GlInt(-10_000_000);

    pub fn from_value(value: f64) -> Self {
        GlInt((value * GL_SCALE).round() as i64)
    }

    pub fn value(self) -> f64 {
        self.0 as f64 / GL_SCALE
    }
}

impl fmt::Display for GlInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.value())
    }
}

/// Stable spatial identifier of a point (longitude/latitude in micro-degrees).
///
/// Serialized as `"lon_lat"` so it can key JSON maps in the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PointId {
    lon_e6: i64,
    lat_e6: i64,
}

impl PointId {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self {
            lon_e6: (lon * 1e6).round() as i64,
            lat_e6: (lat * 1e6).round() as i64,
        }
    }

    pub fn lon(&self) -> f64 {
        self.lon_e6 as f64 / 1e6
    }

    pub fn lat(&self) -> f64 {
        self.lat_e6 as f64 / 1e6
    }
}

impl fmt::Display for PointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.lon(), self.lat())
    }
}

impl FromStr for PointId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lon, lat) = s
            .split_once('_')
            .ok_or_else(|| format!("Invalid point id '{s}' (expected 'lon_lat')."))?;
        let lon: f64 = lon
            .trim()
            .parse()
            .map_err(|_| format!("Invalid longitude in point id '{s}'."))?;
        let lat: f64 = lat
            .trim()
            .parse()
            .map_err(|_| format!("Invalid latitude in point id '{s}'."))?;
        if !(lon.is_finite() && lat.is_finite()) {
            return Err(format!("Non-finite coordinate in point id '{s}'."));
        }
        Ok(PointId::new(lon, lat))
    }
}

impl Serialize for PointId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PointId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Which SAR constellation produced an offset field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Csk,
    S1,
}

impl DataSource {
    pub const ALL: [DataSource; 2] = [DataSource::Csk, DataSource::S1];

    pub fn label(self) -> &'static str {
        match self {
            DataSource::Csk => "csk",
            DataSource::S1 => "s1",
        }
    }
}

impl FromStr for DataSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csk" => Ok(DataSource::Csk),
            "s1" => Ok(DataSource::S1),
            other => Err(format!("Unknown data source '{other}' (expected csk or s1).")),
        }
    }
}

/// One differential offset measurement between two epochs at a point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetField {
    pub source: DataSource,
    pub master_time: NaiveDateTime,
    pub slave_time: NaiveDateTime,
    /// Observed displacement (metres) along `projection`.
    pub offset: f64,
    /// One-sigma noise of `offset` (metres).
    pub sigma: f64,
    /// Unit vector (east, north, up) the displacement is projected onto.
    pub projection: [f64; 3],
    /// Vertical tide height at the master epoch (metres).
    pub tide_master: f64,
    /// Vertical tide height at the slave epoch (metres).
    pub tide_slave: f64,
}

/// Everything the estimator knows about one point.
#[derive(Debug, Clone, PartialEq)]
pub struct PointData {
    pub id: PointId,
    pub offsets: Vec<OffsetField>,
    /// DEM-derived factor per offset, used by the topo-residual column.
    pub dem_factors: Vec<f64>,
    /// Maximum possible offset pairs per source (coverage reporting only).
    pub max_offset_pairs: BTreeMap<DataSource, usize>,
}

impl PointData {
    pub fn count_for(&self, source: DataSource) -> usize {
        self.offsets.iter().filter(|o| o.source == source).count()
    }

    /// Lowest tide height seen by any epoch at this point.
    pub fn lowest_tide_height(&self) -> Option<f64> {
        self.offsets
            .iter()
            .flat_map(|o| [o.tide_master, o.tide_slave])
            .filter(|h| h.is_finite())
            .min_by(|a, b| a.total_cmp(b))
    }
}

/// Per-point coverage statistics for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageStats {
    pub csk_pairs: usize,
    pub max_csk_pairs: usize,
    pub s1_pairs: usize,
    pub max_s1_pairs: usize,
}

impl CoverageStats {
    pub fn of(point: &PointData) -> Self {
        Self {
            csk_pairs: point.count_for(DataSource::Csk),
            max_csk_pairs: point.max_offset_pairs.get(&DataSource::Csk).copied().unwrap_or(0),
            s1_pairs: point.count_for(DataSource::S1),
            max_s1_pairs: point.max_offset_pairs.get(&DataSource::S1).copied().unwrap_or(0),
        }
    }
}

/// Non-fatal per-point conditions. They are reported with the point's result and
/// never abort the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointIssue {
    /// The posterior precision was singular for at least one candidate.
    SingularModel,
    /// The point failed the coverage predicate and was pinned to the sentinel.
    InsufficientCoverage,
    /// Every recorded candidate produced a non-finite likelihood.
    AllCandidatesNaN,
}

/// RMS residual summary of one inversion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResidualSummary {
    /// RMS of the data after removing only the secular-velocity part.
    #[serde(with = "nan_as_null")]
    pub secular: f64,
    /// RMS of the full-model residual.
    #[serde(with = "nan_as_null")]
    pub tidal: f64,
}

impl ResidualSummary {
    pub const NAN: ResidualSummary = ResidualSummary {
        secular: f64::NAN,
        tidal: f64::NAN,
    };
}

/// What one candidate inversion produced, as kept in the likelihood map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandidateOutcome {
    #[serde(with = "nan_as_null")]
    pub log_likelihood: f64,
    #[serde(with = "nan_as_null")]
    pub up_scale: f64,
    pub residual: ResidualSummary,
}

/// Two candidate values bracketing the credible mass around the optimum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CredibleInterval {
    #[serde(with = "nan_as_null")]
    pub low: f64,
    #[serde(with = "nan_as_null")]
    pub high: f64,
}

impl CredibleInterval {
    pub const NAN: CredibleInterval = CredibleInterval {
        low: f64::NAN,
        high: f64::NAN,
    };
}

/// Selected optimum for a point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimalResult {
    /// Optimal grounding level (metres) or NaN when nothing passable was found.
    #[serde(with = "nan_as_null")]
    pub grounding_level: f64,
    pub interval: CredibleInterval,
    /// Posterior up-scale at the optimum.
    #[serde(with = "nan_as_null")]
    pub up_scale: f64,
}

impl OptimalResult {
    pub const NAN: OptimalResult = OptimalResult {
        grounding_level: f64::NAN,
        interval: CredibleInterval::NAN,
        up_scale: f64::NAN,
    };

    pub fn candidate(&self) -> Option<GlInt> {
        self.grounding_level
            .is_finite()
            .then(|| GlInt::from_value(self.grounding_level))
    }
}

impl Default for OptimalResult {
    fn default() -> Self {
        OptimalResult::NAN
    }
}

/// Index into the enumeration stage table.
///
/// `0` means "not started"; the table length means "final stage emitted", after
/// which the point is converged and only the terminal inversion remains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnumerationStage(pub usize);

impl EnumerationStage {
    pub const NOT_STARTED: EnumerationStage = EnumerationStage(0);

    pub fn next(self) -> Self {
        EnumerationStage(self.0 + 1)
    }

    pub fn is_final(self, final_stage: usize) -> bool {
        self.0 >= final_stage
    }
}

/// Resumable search state for a single point.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PerPointSearchState {
    pub completed: BTreeSet<GlInt>,
    pub outcomes: BTreeMap<GlInt, CandidateOutcome>,
    pub stage: EnumerationStage,
    pub optimum: OptimalResult,
    #[serde(default)]
    pub eligible: bool,
}

/// Serde adapter storing non-finite floats as JSON `null`.
///
/// `serde_json` writes NaN as `null` but refuses to read it back into `f64`,
/// which would break checkpoint round-trips for singular candidates.
pub mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_some(value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gl_int_is_exact_for_grid_values() {
        assert_eq!(GlInt::from_value(-2.0), GlInt(-2_000_000));
        assert_eq!(GlInt::from_value(-0.1 * 3.0), GlInt(-300_000));
        assert_eq!(GlInt::from_value(NO_GROUNDING_LEVEL), GlInt::SENTINEL);
        assert!((GlInt(-1_530_000).value() + 1.53).abs() < 1e-12);
    }

    #[test]
    fn point_id_round_trips_through_string() {
        let id = PointId::new(-83.25, -78.5);
        let s = id.to_string();
        assert_eq!(s, "-83.25_-78.5");
        assert_eq!(s.parse::<PointId>().unwrap(), id);
        assert!("nonsense".parse::<PointId>().is_err());
    }

    #[test]
    fn nan_fields_survive_json() {
        let outcome = CandidateOutcome {
            log_likelihood: f64::NAN,
            up_scale: 0.9,
            residual: ResidualSummary::NAN,
        };
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("null"));
        let back: CandidateOutcome = serde_json::from_str(&json).unwrap();
        assert!(back.log_likelihood.is_nan());
        assert!((back.up_scale - 0.9).abs() < 1e-15);
    }
}
