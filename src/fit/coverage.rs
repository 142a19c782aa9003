//! Coverage pre-check.
//!
//! Points whose offsets cannot plausibly place them on the floating shelf are
//! not searched: they are pinned to the sentinel "no grounding" level, which
//! costs one inversion instead of a full grid.

use crate::domain::{CoverageCheck, PointData};

/// Whether `point` should get the full grounding-level search.
pub fn is_eligible(check: &CoverageCheck, point: &PointData) -> bool {
    match *check {
        CoverageCheck::All => true,
        CoverageCheck::SouthernHalf {
            split_latitude,
            min_offsets,
        } => point.id.lat() < split_latitude && point.offsets.len() >= min_offsets,
        CoverageCheck::MinOffsets { min_offsets } => point.offsets.len() >= min_offsets,
    }
}
