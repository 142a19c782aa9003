//! Estimation orchestration.
//!
//! Given:
//! - per-point offset fields
//! - a run configuration (mode, stages, priors, optional terms)
//! - the resumable per-point search states from an earlier run
//!
//! we repeat, round by round:
//! - ask the enumerator for each point's next batch of grounding levels
//! - build the candidate matrix from the point's cached base matrix
//! - invert and record likelihood, up-scale and residuals
//! - reselect each point's optimum (the next stage re-centres on it)
//!
//! and once every point is converged run one terminal inversion per point at the
//! selected level. Points are processed in parallel; candidates within a point
//! run in round order.

use std::collections::BTreeMap;

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::Serialize;

use crate::domain::{
    CandidateOutcome, CoverageStats, EstimateConfig, GlInt, OptimalResult, PerPointSearchState, PointData,
    PointId, PointIssue, ResidualSummary, SearchMode, NO_GROUNDING_LEVEL, nan_as_null,
};
use crate::error::AppError;
use crate::fit::coverage::is_eligible;
use crate::fit::selection::{record, select_optimal};
use crate::fit::stages::{GroundingLevelEnumerator, SearchPlan, StageTable, grid_ints};
use crate::math::inversion::{ModelPosterior, data_precision, invert, log_evidence, pseudo_log_det};
use crate::math::tides::Constituent;
use crate::models::design::{
    ColumnLayout, DesignMatrix, ModifierChain, UpDisplacements, build, model_prior, modify_for_grounding_level,
};
use crate::models::params::{
    SourceResidual, TideParams, residual_by_source, residual_summary, tide_params, up_scale,
};

/// Which grounding level a round applies to each point.
#[derive(Debug, Clone, PartialEq)]
pub enum Candidate {
    /// No grounding-level term (plain linear model).
    Null,
    /// One level shared by every point in the round.
    Scalar(GlInt),
    /// A different level per point; absent points sit the round out.
    PerPoint(BTreeMap<PointId, GlInt>),
    /// The optimum recorded in each point's search state.
    UseOptimal,
    /// Levels supplied from outside the search.
    UseExternal(BTreeMap<PointId, f64>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Resolved {
    Skip,
    Linear,
    Level(f64),
}

impl Candidate {
    fn resolve(&self, id: &PointId, state: &PerPointSearchState) -> Resolved {
        match self {
            Candidate::Null => Resolved::Linear,
            Candidate::Scalar(gl) => Resolved::Level(gl.value()),
            Candidate::PerPoint(map) => map
                .get(id)
                .map_or(Resolved::Skip, |gl| Resolved::Level(gl.value())),
            // Ineligible points are pinned to the sentinel whatever level was supplied.
            Candidate::UseOptimal | Candidate::UseExternal(_) if !state.eligible => {
                Resolved::Level(NO_GROUNDING_LEVEL)
            }
            Candidate::UseOptimal => {
                let gl = state.optimum.grounding_level;
                if gl.is_finite() { Resolved::Level(gl) } else { Resolved::Skip }
            }
            Candidate::UseExternal(map) => match map.get(id) {
                Some(gl) if gl.is_finite() => Resolved::Level(*gl),
                _ => Resolved::Skip,
            },
        }
    }

    /// Key under which a search candidate is recorded (search variants only).
    fn search_key(&self, id: &PointId) -> Option<GlInt> {
        match self {
            Candidate::Scalar(gl) => Some(*gl),
            Candidate::PerPoint(map) => map.get(id).copied(),
            _ => None,
        }
    }
}

/// Turn per-point batches into the round's candidate list.
///
/// Identical batches become shared scalars; otherwise candidates are aligned by
/// batch position, one per-point map per position.
pub fn assemble_round(ids: &[PointId], batches: &[Option<Vec<GlInt>>]) -> Vec<Candidate> {
    let first = batches.first().cloned().flatten();
    if batches.iter().all(|b| *b == batches[0]) {
        return first
            .unwrap_or_default()
            .into_iter()
            .map(Candidate::Scalar)
            .collect();
    }

    let width = batches.iter().flatten().map(Vec::len).max().unwrap_or(0);
    (0..width)
        .map(|i| {
            let map = ids
                .iter()
                .zip(batches)
                .filter_map(|(id, b)| b.as_ref().and_then(|v| v.get(i)).map(|gl| (*id, *gl)))
                .collect();
            Candidate::PerPoint(map)
        })
        .collect()
}

/// Everything about a point that does not depend on the candidate.
struct PointContext<'a> {
    data: &'a PointData,
    base: DesignMatrix,
    up: UpDisplacements,
    d: DVector<f64>,
    inv_cd: DMatrix<f64>,
    log_det_inv_cd: f64,
}

impl<'a> PointContext<'a> {
    fn new(data: &'a PointData, tides: &[Constituent]) -> Self {
        let sigmas: Vec<f64> = data.offsets.iter().map(|o| o.sigma).collect();
        let inv_cd = data_precision(&sigmas);
        Self {
            data,
            base: build(data, tides),
            up: UpDisplacements::of(&data.offsets),
            d: DVector::from_iterator(data.offsets.len(), data.offsets.iter().map(|o| o.offset)),
            // Diagonal, so the log-determinant is the sum of the log precisions.
            log_det_inv_cd: inv_cd.diagonal().iter().map(|v| v.ln()).sum(),
            inv_cd,
        }
    }
}

/// One inversion at one candidate.
#[derive(Debug, Clone)]
pub struct CandidateInversion {
    pub matrix: DesignMatrix,
    pub posterior: ModelPosterior,
    pub log_likelihood: f64,
    pub residual: ResidualSummary,
}

/// Terminal inversion packaged for reporting.
#[derive(Debug, Clone)]
pub struct FinalInversion {
    /// Grounding level used (None for the plain linear model).
    pub grounding_level: Option<f64>,
    pub posterior: ModelPosterior,
    pub log_likelihood: f64,
    pub residual: ResidualSummary,
    pub residual_by_source: BTreeMap<crate::domain::DataSource, SourceResidual>,
    pub tide: TideParams,
}

/// One solved candidate on a point's probability curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CurveSample {
    pub grounding_level: f64,
    #[serde(with = "nan_as_null")]
    pub log_likelihood: f64,
    pub probability: f64,
}

/// Search outcome for one point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchSummary {
    pub optimum: OptimalResult,
    pub curve: Vec<CurveSample>,
    pub n_candidates: usize,
    pub stage: usize,
}

/// Final per-point result.
#[derive(Debug, Clone)]
pub struct PointEstimate {
    pub id: PointId,
    pub coverage: CoverageStats,
    pub lowest_tide_height: Option<f64>,
    pub search: Option<SearchSummary>,
    pub inversion: Option<FinalInversion>,
    pub issues: Vec<PointIssue>,
}

/// Output of a run.
#[derive(Debug, Clone)]
pub struct EstimateOutput {
    pub points: Vec<PointEstimate>,
    pub rounds: usize,
    /// Every point finished its search (terminal inversions were run).
    pub converged: bool,
}

/// Drives enumeration, inversion and selection over a point set.
pub struct EstimationOrchestrator<'a> {
    config: &'a EstimateConfig,
    tides: Vec<Constituent>,
    modifiers: ModifierChain,
    layout: ColumnLayout,
    inv_cm: DMatrix<f64>,
    log_det_inv_cm: f64,
    enumerator: Option<GroundingLevelEnumerator>,
}

impl<'a> EstimationOrchestrator<'a> {
    pub fn new(config: &'a EstimateConfig) -> Result<Self, AppError> {
        config.validate()?;
        let tides = config.constituents()?;
        let layout = ColumnLayout::planned(config, tides.len());
        // The prior depends on the layout only, so it is shared by every candidate.
        let inv_cm = model_prior(&layout, &config.prior);
        let log_det_inv_cm = pseudo_log_det(&inv_cm);
        let final_stage = config.stages.len();

        let plan = match &config.mode {
            SearchMode::SingleValue { value } => Some(SearchPlan::Fixed(vec![GlInt::from_value(*value)])),
            SearchMode::Manual { values } => {
                let mut ints: Vec<GlInt> = values.iter().map(|v| GlInt::from_value(*v)).collect();
                ints.sort();
                ints.dedup();
                Some(SearchPlan::Fixed(ints))
            }
            SearchMode::ManualRange { low, high, spacing } => {
                Some(SearchPlan::Fixed(grid_ints(*low, *high, *spacing)?))
            }
            SearchMode::Auto => Some(SearchPlan::Auto(StageTable::new(
                config.bounds,
                config.stages.clone(),
            )?)),
            SearchMode::SimpleLinear | SearchMode::External { .. } | SearchMode::InvertOptimal => None,
        };

        Ok(Self {
            config,
            modifiers: ModifierChain::from_config(config),
            layout,
            inv_cm,
            log_det_inv_cm,
            enumerator: plan.map(|p| GroundingLevelEnumerator::new(p, final_stage)),
            tides,
        })
    }

    pub fn tides(&self) -> &[Constituent] {
        &self.tides
    }

    /// Invert one point at one resolved level (`None` = plain linear model).
    fn invert_at(&self, ctx: &PointContext<'_>, level: Option<f64>) -> Result<CandidateInversion, AppError> {
        let matrix = match level {
            None => ctx.base.clone(),
            Some(gl) => modify_for_grounding_level(&ctx.base, &ctx.data.offsets, &ctx.up, gl)?,
        };
        let matrix = self.modifiers.apply(&matrix, ctx.data)?;
        if matrix.layout() != &self.layout {
            return Err(AppError::internal(
                format!("Design matrix layout for {} does not match the model prior.", ctx.data.id),
            ));
        }

        let posterior = invert(matrix.matrix(), &ctx.d, &ctx.inv_cd, &self.inv_cm);
        let log_likelihood = log_evidence(
            matrix.matrix(),
            &ctx.d,
            (&ctx.inv_cd, ctx.log_det_inv_cd),
            (&self.inv_cm, self.log_det_inv_cm),
            &posterior,
        );
        let residual = residual_summary(&matrix, &ctx.d, &posterior);

        Ok(CandidateInversion {
            matrix,
            posterior,
            log_likelihood,
            residual,
        })
    }

    /// Evaluate a search candidate for one point and record it.
    fn evaluate(
        &self,
        ctx: &PointContext<'_>,
        state: &mut PerPointSearchState,
        candidate: &Candidate,
    ) -> Result<(), AppError> {
        let id = ctx.data.id;
        let Some(key) = candidate.search_key(&id) else {
            return Ok(());
        };
        if state.completed.contains(&key) {
            return Ok(());
        }
        let Resolved::Level(gl) = candidate.resolve(&id, state) else {
            return Ok(());
        };

        let inv = self.invert_at(ctx, Some(gl))?;
        if inv.posterior.is_singular() {
            debug!("{id}: singular posterior at grounding level {gl:.3}");
        }
        let outcome = CandidateOutcome {
            log_likelihood: inv.log_likelihood,
            up_scale: up_scale(&inv.matrix, &inv.posterior),
            residual: inv.residual,
        };
        debug!(
            "{id}: gl={gl:.3} log_likelihood={:.4} up_scale={:.4}",
            outcome.log_likelihood, outcome.up_scale
        );
        record(state, key, outcome);
        Ok(())
    }

    /// Run the configured mode over `points`, updating `states` in place.
    ///
    /// `states` is the checkpoint content: it is read at the start and the caller
    /// persists it once at the end.
    pub fn run(
        &self,
        points: &[PointData],
        states: &mut BTreeMap<PointId, PerPointSearchState>,
    ) -> Result<EstimateOutput, AppError> {
        let contexts: Vec<PointContext<'_>> = points
            .par_iter()
            .map(|p| PointContext::new(p, &self.tides))
            .collect();
        let ids: Vec<PointId> = points.iter().map(|p| p.id).collect();

        let mut work: Vec<PerPointSearchState> = points
            .iter()
            .map(|p| {
                let mut state = states.get(&p.id).cloned().unwrap_or_default();
                state.eligible = is_eligible(&self.config.coverage, p);
                state
            })
            .collect();

        let ineligible = work.iter().filter(|s| !s.eligible).count();
        if ineligible > 0 {
            info!("{ineligible} of {} points fail the coverage check and are pinned to the sentinel", points.len());
        }

        let (terminal, rounds, converged) = match &self.config.mode {
            SearchMode::SimpleLinear => (Candidate::Null, 0, true),
            SearchMode::External { values } => (Candidate::UseExternal(values.clone()), 0, true),
            SearchMode::InvertOptimal => {
                self.ensure_search_finished(&ids, &work)?;
                (Candidate::UseOptimal, 0, true)
            }
            _ => {
                let (rounds, converged) = self.search(&ids, &contexts, &mut work)?;
                (Candidate::UseOptimal, rounds, converged)
            }
        };

        for (id, state) in ids.iter().zip(&work) {
            states.insert(*id, state.clone());
        }

        if !converged {
            info!("Stopped after {rounds} round(s); rerun to continue the search");
        }

        let estimates: Vec<PointEstimate> = contexts
            .par_iter()
            .zip(work.par_iter())
            .map(|(ctx, state)| self.package(ctx, state, converged.then_some(&terminal)))
            .collect::<Result<_, _>>()?;

        let nan_points = estimates
            .iter()
            .filter(|e| e.issues.contains(&PointIssue::AllCandidatesNaN))
            .count();
        if nan_points > 0 {
            warn!("{nan_points} point(s) have no finite likelihood at any candidate");
        }

        Ok(EstimateOutput {
            points: estimates,
            rounds,
            converged,
        })
    }

    fn ensure_search_finished(&self, ids: &[PointId], work: &[PerPointSearchState]) -> Result<(), AppError> {
        let final_stage = self.config.stages.len();
        let unfinished: Vec<String> = ids
            .iter()
            .zip(work)
            .filter(|(_, s)| s.eligible && (!s.stage.is_final(final_stage) || s.completed.is_empty()))
            .map(|(id, _)| id.to_string())
            .collect();
        if unfinished.is_empty() {
            return Ok(());
        }
        Err(AppError::config(format!(
            "invert_optimal requested but {} point(s) still have enumeration to do (e.g. {}).",
            unfinished.len(),
            unfinished[0]
        )))
    }

    /// Enumerate until every point is converged or the round budget is spent.
    fn search(
        &self,
        ids: &[PointId],
        contexts: &[PointContext<'_>],
        work: &mut [PerPointSearchState],
    ) -> Result<(usize, bool), AppError> {
        let Some(enumerator) = &self.enumerator else {
            return Err(AppError::config("Search requested for a mode without an enumeration plan."));
        };
        let coverage = self.config.credible_coverage;
        let mut rounds = 0usize;

        loop {
            if self.config.max_rounds.is_some_and(|max| rounds >= max) {
                let converged = work.iter().all(|s| is_converged(enumerator, s));
                return Ok((rounds, converged));
            }

            let batches: Vec<Option<Vec<GlInt>>> = work
                .par_iter_mut()
                .map(|s| enumerator.next_batch(s))
                .collect::<Result<_, _>>()?;
            if batches.iter().all(Option::is_none) {
                return Ok((rounds, true));
            }
            rounds += 1;

            let round = assemble_round(ids, &batches);
            let active = batches.iter().filter(|b| b.is_some()).count();
            info!(
                "Round {rounds}: {} candidate(s) across {active} active point(s)",
                round.len()
            );

            for candidate in &round {
                contexts
                    .par_iter()
                    .zip(work.par_iter_mut())
                    .try_for_each(|(ctx, state)| self.evaluate(ctx, state, candidate))?;
            }

            work.par_iter_mut().for_each(|s| {
                s.optimum = select_optimal(s, coverage).optimum;
            });
        }
    }

    fn package(
        &self,
        ctx: &PointContext<'_>,
        state: &PerPointSearchState,
        terminal: Option<&Candidate>,
    ) -> Result<PointEstimate, AppError> {
        let id = ctx.data.id;
        let mut issues = Vec::new();
        if !state.eligible && self.config.uses_grounding_level() {
            issues.push(PointIssue::InsufficientCoverage);
        }
        if state.outcomes.values().any(|o| !o.log_likelihood.is_finite()) {
            issues.push(PointIssue::SingularModel);
        }

        let search = if state.outcomes.is_empty() {
            None
        } else {
            let selection = select_optimal(state, self.config.credible_coverage);
            if let Some(issue) = selection.issue {
                issues.push(issue);
            }
            let curve = selection
                .probabilities
                .iter()
                .map(|(gl, probability)| CurveSample {
                    grounding_level: gl.value(),
                    log_likelihood: state.outcomes.get(gl).map_or(f64::NAN, |o| o.log_likelihood),
                    probability: *probability,
                })
                .collect();
            Some(SearchSummary {
                optimum: selection.optimum,
                curve,
                n_candidates: state.outcomes.len(),
                stage: state.stage.0,
            })
        };

        let inversion = match terminal.map(|c| c.resolve(&id, state)) {
            None | Some(Resolved::Skip) => None,
            Some(Resolved::Linear) => Some(self.final_inversion(ctx, None)?),
            Some(Resolved::Level(gl)) => Some(self.final_inversion(ctx, Some(gl))?),
        };
        if inversion.as_ref().is_some_and(|inv| inv.posterior.is_singular())
            && !issues.contains(&PointIssue::SingularModel)
        {
            issues.push(PointIssue::SingularModel);
        }

        Ok(PointEstimate {
            id,
            coverage: CoverageStats::of(ctx.data),
            lowest_tide_height: ctx.data.lowest_tide_height(),
            search,
            inversion,
            issues,
        })
    }

    fn final_inversion(&self, ctx: &PointContext<'_>, level: Option<f64>) -> Result<FinalInversion, AppError> {
        let inv = self.invert_at(ctx, level)?;
        let by_source = residual_by_source(&inv.matrix, &ctx.d, &inv.posterior, &ctx.data.offsets);
        let tide = tide_params(&inv.matrix, &self.tides, &inv.posterior);
        Ok(FinalInversion {
            grounding_level: level,
            log_likelihood: inv.log_likelihood,
            residual: inv.residual,
            residual_by_source: by_source,
            tide,
            posterior: inv.posterior,
        })
    }
}

/// Whether the enumerator has nothing left for `state`, without advancing it.
fn is_converged(enumerator: &GroundingLevelEnumerator, state: &PerPointSearchState) -> bool {
    matches!(enumerator.next_batch(&mut state.clone()), Ok(None))
}
