//! Grounding-level candidate enumeration.
//!
//! We search the grounding level with a deterministic grid rather than a
//! nonlinear optimizer:
//! - the evidence surface has flat plateaus (levels above or below every tide
//!   give identical matrices), which trap local optimizers
//! - grids are reproducible and resumable: a candidate is identified by its
//!   integer key, so a rerun can skip everything already solved
//!
//! `auto` mode refines in stages. Stage 1 spans the global bounds at coarse
//! spacing; every later stage spans `±half_range` around the current optimum at
//! finer spacing, clipped to the bounds. `manual` and `single_value` modes emit a
//! fixed list once. In every mode the batch is the set difference with the
//! point's completed candidates.

use std::collections::BTreeSet;

use crate::domain::{EnumerationStage, GlInt, PerPointSearchState, SearchBounds, StageSpec};
use crate::error::AppError;

/// Integer candidates `low, low+spacing, …` up to and including `high`.
///
/// Works on integer keys so that repeated additions cannot drift.
pub fn grid_ints(low: f64, high: f64, spacing: f64) -> Result<Vec<GlInt>, AppError> {
    if !(low.is_finite() && high.is_finite() && spacing.is_finite() && spacing > 0.0 && high >= low) {
        return Err(AppError::config(
            format!("Invalid grounding-level grid: low={low}, high={high}, spacing={spacing}."),
        ));
    }
    let lo = GlInt::from_value(low).0;
    let hi = GlInt::from_value(high).0;
    let step = GlInt::from_value(spacing).0;
    if step <= 0 {
        return Err(AppError::config(format!("Grid spacing {spacing} is below resolution.")));
    }

    let n = (hi - lo) / step + 1;
    Ok((0..n).map(|i| GlInt(lo + i * step)).collect())
}

/// Bounds plus the per-stage `(half_range, spacing)` table.
#[derive(Debug, Clone, PartialEq)]
pub struct StageTable {
    bounds: SearchBounds,
    stages: Vec<StageSpec>,
}

impl StageTable {
    pub fn new(bounds: SearchBounds, stages: Vec<StageSpec>) -> Result<Self, AppError> {
        if stages.is_empty() {
            return Err(AppError::config("Stage table must contain at least one stage."));
        }
        Ok(Self { bounds, stages })
    }

    /// Index of the last stage; reaching it means the search is converged.
    pub fn final_stage(&self) -> usize {
        self.stages.len()
    }

    /// Candidates for 1-based `stage` around `reference`.
    ///
    /// A NaN reference (no passable optimum yet) falls back to the lower bound.
    pub fn candidates(&self, stage: usize, reference: f64) -> Result<Vec<GlInt>, AppError> {
        let Some(row) = stage.checked_sub(1).and_then(|i| self.stages.get(i)) else {
            return Err(AppError::config(
                format!("Unknown enumeration stage {stage} (table has {}).", self.stages.len()),
            ));
        };

        let SearchBounds { low, high } = self.bounds;
        let Some(half_range) = row.half_range else {
            return grid_ints(low, high, row.spacing);
        };

        let reference = if reference.is_finite() { reference } else { low };
        let lo = GlInt::from_value(low);
        let hi = GlInt::from_value(high);

        let start = GlInt::from_value(reference - half_range).0;
        let step = GlInt::from_value(row.spacing).0;
        let n = (GlInt::from_value(2.0 * half_range).0 / step.max(1)) + 1;

        // Clipping to the bounds can collapse several grid points onto one bound.
        let set: BTreeSet<GlInt> = (0..n)
            .map(|i| GlInt(start + i * step).clamp(lo, hi))
            .collect();
        Ok(set.into_iter().collect())
    }
}

/// The search plan resolved from the configured mode.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchPlan {
    /// A fixed list emitted once (manual, manual range, single value).
    Fixed(Vec<GlInt>),
    /// Staged refinement.
    Auto(StageTable),
}

/// Produces the next batch of candidates for a point.
#[derive(Debug, Clone)]
pub struct GroundingLevelEnumerator {
    plan: SearchPlan,
    final_stage: usize,
}

impl GroundingLevelEnumerator {
    /// `final_stage` is the stage index recorded once a fixed list is emitted,
    /// so that fixed and auto runs share one notion of "converged".
    pub fn new(plan: SearchPlan, final_stage: usize) -> Self {
        let final_stage = match &plan {
            SearchPlan::Auto(table) => table.final_stage(),
            SearchPlan::Fixed(_) => final_stage,
        };
        Self { plan, final_stage }
    }

    pub fn final_stage(&self) -> usize {
        self.final_stage
    }

    /// Next batch for `state`, or `None` once nothing is left to search.
    ///
    /// Advances `state.stage`. Ineligible points only ever see the sentinel.
    pub fn next_batch(&self, state: &mut PerPointSearchState) -> Result<Option<Vec<GlInt>>, AppError> {
        if !state.eligible {
            state.stage = EnumerationStage(self.final_stage);
            return Ok(remaining(&[GlInt::SENTINEL], state));
        }

        match &self.plan {
            SearchPlan::Fixed(values) => {
                state.stage = EnumerationStage(self.final_stage);
                Ok(remaining(values, state))
            }
            SearchPlan::Auto(table) => {
                if state.stage.is_final(table.final_stage()) {
                    return Ok(None);
                }
                let next = state.stage.next();
                let batch = table.candidates(next.0, state.optimum.grounding_level)?;
                state.stage = next;
                // An empty batch still advances the stage (everything was resumed).
                Ok(Some(remaining(&batch, state).unwrap_or_default()))
            }
        }
    }
}

/// `requested − completed`, sorted; `None` when nothing remains.
fn remaining(requested: &[GlInt], state: &PerPointSearchState) -> Option<Vec<GlInt>> {
    let todo: BTreeSet<GlInt> = requested
        .iter()
        .copied()
        .filter(|c| !state.completed.contains(c))
        .collect();
    if todo.is_empty() {
        None
    } else {
        Some(todo.into_iter().collect())
    }
}
