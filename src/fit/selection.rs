//! Likelihood bookkeeping and optimal grounding-level selection.
//!
//! Every solved candidate is recorded in the point's [`PerPointSearchState`].
//! Selection then:
//! 1. converts log-likelihoods to probabilities (subtract the max, exponentiate,
//!    normalize); non-finite candidates get probability 0
//! 2. picks the arg-max as the optimum (ties go to the lower level)
//! 3. grows a credible interval outward from the optimum, always taking the
//!    more probable neighbour, until the target mass is reached

use crate::domain::{
    CandidateOutcome, CredibleInterval, GlInt, OptimalResult, PerPointSearchState, PointIssue,
};

/// Default credible mass.
pub const DEFAULT_COVERAGE: f64 = 0.68;

/// Record one solved candidate.
pub fn record(state: &mut PerPointSearchState, candidate: GlInt, outcome: CandidateOutcome) {
    state.completed.insert(candidate);
    state.outcomes.insert(candidate, outcome);
}

/// Normalized probability per candidate, ascending by candidate.
///
/// Returns an empty list when no candidate has a finite likelihood.
pub fn normalize(state: &PerPointSearchState) -> Vec<(GlInt, f64)> {
    let max = state
        .outcomes
        .values()
        .map(|o| o.log_likelihood)
        .filter(|v| v.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return Vec::new();
    }

    let weights: Vec<(GlInt, f64)> = state
        .outcomes
        .iter()
        .map(|(gl, o)| {
            let w = if o.log_likelihood.is_finite() {
                (o.log_likelihood - max).exp()
            } else {
                0.0
            };
            (*gl, w)
        })
        .collect();
    let total: f64 = weights.iter().map(|(_, w)| w).sum();

    weights.into_iter().map(|(gl, w)| (gl, w / total)).collect()
}

/// Result of selection plus the probability curve it was derived from.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub optimum: OptimalResult,
    pub probabilities: Vec<(GlInt, f64)>,
    pub issue: Option<PointIssue>,
}

/// Select the optimal candidate and its credible interval.
pub fn select_optimal(state: &PerPointSearchState, coverage: f64) -> Selection {
    let probabilities = normalize(state);
    if probabilities.is_empty() {
        let issue = (!state.outcomes.is_empty()).then_some(PointIssue::AllCandidatesNaN);
        return Selection {
            optimum: OptimalResult::NAN,
            probabilities,
            issue,
        };
    }

    let mut best = 0;
    for (i, (_, p)) in probabilities.iter().enumerate() {
        if *p > probabilities[best].1 {
            best = i;
        }
    }

    let (lo, hi) = credible_bounds(&probabilities, best, coverage);
    let optimum_gl = probabilities[best].0;
    let up_scale = state
        .outcomes
        .get(&optimum_gl)
        .map(|o| o.up_scale)
        .unwrap_or(f64::NAN);

    Selection {
        optimum: OptimalResult {
            grounding_level: optimum_gl.value(),
            interval: CredibleInterval {
                low: probabilities[lo].0.value(),
                high: probabilities[hi].0.value(),
            },
            up_scale,
        },
        probabilities,
        issue: None,
    }
}

/// Indices `(lo, hi)` of the smallest greedy window around `center` holding `coverage`.
fn credible_bounds(probs: &[(GlInt, f64)], center: usize, coverage: f64) -> (usize, usize) {
    let (mut lo, mut hi) = (center, center);
    let mut mass = probs[center].1;
    // Tolerance keeps an exact 100% target from overrunning on rounding.
    while mass < coverage - 1e-12 {
        let left = lo.checked_sub(1).map(|i| probs[i].1);
        let right = (hi + 1 < probs.len()).then(|| probs[hi + 1].1);
        match (left, right) {
            (Some(l), Some(r)) if l >= r => {
                lo -= 1;
                mass += l;
            }
            (_, Some(r)) => {
                hi += 1;
                mass += r;
            }
            (Some(l), None) => {
                lo -= 1;
                mass += l;
            }
            (None, None) => break,
        }
    }
    (lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ResidualSummary;

    fn outcome(ll: f64, up: f64) -> CandidateOutcome {
        CandidateOutcome {
            log_likelihood: ll,
            up_scale: up,
            residual: ResidualSummary::NAN,
        }
    }

    fn state_with(entries: &[(f64, f64)]) -> PerPointSearchState {
        let mut state = PerPointSearchState::default();
        for (i, (gl, ll)) in entries.iter().enumerate() {
            record(&mut state, GlInt::from_value(*gl), outcome(*ll, i as f64));
        }
        state
    }

    #[test]
    fn probabilities_are_normalized_and_non_negative() {
        let state = state_with(&[(-1.0, -1000.0), (-0.5, -998.0), (0.0, f64::NAN), (0.5, -1003.0)]);
        let probs = normalize(&state);
        let total: f64 = probs.iter().map(|(_, p)| p).sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert!(probs.iter().all(|(_, p)| *p >= 0.0));
        assert_eq!(probs[2].1, 0.0);
    }

    #[test]
    fn optimum_is_max_likelihood_and_interval_brackets_it() {
        let state = state_with(&[(-2.0, -10.0), (-1.0, -2.0), (0.0, -1.0), (1.0, -1.5), (2.0, -9.0)]);
        let sel = select_optimal(&state, DEFAULT_COVERAGE);
        assert_eq!(sel.optimum.grounding_level, 0.0);
        assert_eq!(sel.optimum.up_scale, 2.0);
        let ci = sel.optimum.interval;
        assert!(ci.low <= 0.0 && 0.0 <= ci.high);
        // The optimum alone holds < 68%, so the more probable neighbour (1.0) joins first.
        assert_eq!(ci.high, 1.0);
    }

    #[test]
    fn all_nan_reports_nan_optimum_and_issue() {
        let state = state_with(&[(-1.0, f64::NAN), (0.0, f64::NAN)]);
        let sel = select_optimal(&state, DEFAULT_COVERAGE);
        assert!(sel.optimum.grounding_level.is_nan());
        assert!(sel.optimum.interval.low.is_nan() && sel.optimum.interval.high.is_nan());
        assert_eq!(sel.issue, Some(PointIssue::AllCandidatesNaN));
    }

    #[test]
    fn full_coverage_spans_every_candidate() {
        let state = state_with(&[(-1.0, -3.0), (0.0, -1.0), (1.0, -2.0)]);
        let sel = select_optimal(&state, 1.0);
        assert_eq!(sel.optimum.interval.low, -1.0);
        assert_eq!(sel.optimum.interval.high, 1.0);
    }
}
