mod common;

use std::collections::{BTreeMap, BTreeSet};

use common::{config, external, init_logging, manual, single_offset_point, synthetic};
use gl_search::app::pipeline::run_points;
use gl_search::domain::{
    CoverageCheck, EstimateConfig, GlInt, NO_GROUNDING_LEVEL, PerPointSearchState, PointIssue, PriorConfig,
    SearchMode,
};
use gl_search::models::design::{Block, ColumnLayout};
use gl_search::io::checkpoint::{SearchCheckpoint, read_checkpoint, write_checkpoint};

fn first_max(state: &PerPointSearchState) -> GlInt {
    let mut best: Option<(GlInt, f64)> = None;
    for (gl, o) in &state.outcomes {
        if !o.log_likelihood.is_finite() {
            continue;
        }
        if best.is_none_or(|(_, ll)| o.log_likelihood > ll) {
            best = Some((*gl, o.log_likelihood));
        }
    }
    best.map(|(gl, _)| gl).expect("at least one finite likelihood")
}

#[test]
fn manual_list_is_solved_once_and_optimum_is_max_likelihood() {
    init_logging();
    let point = single_offset_point(-80.0, (0.3, -0.2));
    let config = manual(&[-2.0, -1.0, 0.0]);
    let mut checkpoint = SearchCheckpoint::new();

    let output = run_points(&config, std::slice::from_ref(&point), &mut checkpoint).unwrap();
    assert!(output.converged);

    let state = &checkpoint.points[&point.id];
    let expected: BTreeSet<GlInt> = [GlInt(-2_000_000), GlInt(-1_000_000), GlInt(0)].into();
    assert_eq!(state.completed, expected);
    assert_eq!(GlInt::from_value(state.optimum.grounding_level), first_max(state));

    let estimate = &output.points[0];
    assert!(estimate.inversion.is_some());
    let curve = &estimate.search.as_ref().unwrap().curve;
    let total: f64 = curve.iter().map(|s| s.probability).sum();
    assert!((total - 1.0).abs() < 1e-9);

    // Resuming with the persisted state has nothing left to solve.
    let before = state.clone();
    let again = run_points(&config, std::slice::from_ref(&point), &mut checkpoint).unwrap();
    assert_eq!(again.rounds, 0);
    assert_eq!(checkpoint.points[&point.id].outcomes, before.outcomes);
}

#[test]
fn auto_search_recovers_synthetic_grounding_level() {
    init_logging();
    let sample = synthetic(1, 1, -0.5);
    let point = &sample.points[0];
    let truth = sample.truth[&point.id];
    let mut checkpoint = SearchCheckpoint::new();

    let output = run_points(&config(SearchMode::Auto), &sample.points, &mut checkpoint).unwrap();
    assert!(output.converged);
    assert_eq!(output.rounds, 3);

    let state = &checkpoint.points[&point.id];
    assert!(state.stage.is_final(3));
    assert!(state.completed.len() >= 81);

    let optimum = state.optimum;
    assert!((optimum.grounding_level - truth).abs() <= 0.1, "optimum {}", optimum.grounding_level);
    assert!(optimum.interval.low <= optimum.grounding_level);
    assert!(optimum.grounding_level <= optimum.interval.high);
    assert!((optimum.up_scale - 1.0).abs() < 0.2, "up_scale {}", optimum.up_scale);

    let inversion = output.points[0].inversion.as_ref().unwrap();
    assert_eq!(inversion.grounding_level, Some(optimum.grounding_level));
    assert!(inversion.residual.tidal < 0.05);
    assert!(inversion.tide.up_scale.is_some());
}

#[test]
fn later_stages_stay_inside_the_refinement_window() {
    let sample = synthetic(1, 1, 1.2);
    let mut checkpoint = SearchCheckpoint::new();
    let mut stage_one = config(SearchMode::Auto);
    stage_one.max_rounds = Some(1);
    run_points(&stage_one, &sample.points, &mut checkpoint).unwrap();

    let id = sample.points[0].id;
    let after_one = checkpoint.points[&id].clone();
    assert_eq!(after_one.completed.len(), 81);
    let reference = after_one.optimum.grounding_level;

    let mut stage_two = config(SearchMode::Auto);
    stage_two.max_rounds = Some(1);
    run_points(&stage_two, &sample.points, &mut checkpoint).unwrap();

    let added: Vec<f64> = checkpoint.points[&id]
        .completed
        .difference(&after_one.completed)
        .map(|gl| gl.value())
        .collect();
    assert!(!added.is_empty());
    for v in added {
        assert!(v >= (reference - 0.15).max(-4.0) - 1e-9 && v <= (reference + 0.15).min(4.0) + 1e-9);
    }
}

#[test]
fn ineligible_point_only_sees_the_sentinel() {
    let point = single_offset_point(-80.0, (0.3, -0.2));
    for mode in [SearchMode::Auto, SearchMode::Manual { values: vec![-1.0, 0.0] }] {
        let config = EstimateConfig {
            coverage: CoverageCheck::MinOffsets { min_offsets: 10 },
            ..config(mode)
        };
        let mut checkpoint = SearchCheckpoint::new();
        let output = run_points(&config, std::slice::from_ref(&point), &mut checkpoint).unwrap();
        run_points(&config, std::slice::from_ref(&point), &mut checkpoint).unwrap();

        let state = &checkpoint.points[&point.id];
        assert_eq!(state.completed, BTreeSet::from([GlInt::SENTINEL]));
        assert!(output.points[0].issues.contains(&PointIssue::InsufficientCoverage));
    }
}

#[test]
fn singular_candidates_are_nan_and_do_not_halt_the_search() {
    init_logging();
    // Tides stay within ±0.5 m, so a 4 m grounding level zeroes the up-scale column.
    let point = single_offset_point(-80.0, (0.5, -0.5));
    let config = EstimateConfig {
        prior: PriorConfig {
            up_scale: None,
            ..PriorConfig::default()
        },
        ..manual(&[0.0, 4.0])
    };
    let mut checkpoint = SearchCheckpoint::new();
    let output = run_points(&config, std::slice::from_ref(&point), &mut checkpoint).unwrap();

    let state = &checkpoint.points[&point.id];
    assert!(state.outcomes[&GlInt(4_000_000)].log_likelihood.is_nan());
    assert!(state.outcomes[&GlInt(4_000_000)].up_scale.is_nan());
    assert!(state.outcomes[&GlInt(0)].log_likelihood.is_finite());
    assert_eq!(state.optimum.grounding_level, 0.0);
    assert!(output.points[0].issues.contains(&PointIssue::SingularModel));
}

#[test]
fn all_nan_point_reports_nan_optimum_without_aborting_others() {
    // Tides within ±0.5 m: both candidates zero the up-scale column.
    let stuck = single_offset_point(-80.0, (0.5, -0.5));
    // A 5 m tide keeps the 4 m candidate solvable.
    let fine = single_offset_point(-79.0, (5.0, -0.5));
    let config = EstimateConfig {
        prior: PriorConfig {
            up_scale: None,
            ..PriorConfig::default()
        },
        ..manual(&[4.0, 5.0])
    };
    let mut checkpoint = SearchCheckpoint::new();
    let output = run_points(&config, &[stuck.clone(), fine.clone()], &mut checkpoint).unwrap();
    let by_id: BTreeMap<_, _> = output.points.iter().map(|p| (p.id, p)).collect();

    let p = by_id[&stuck.id];
    assert!(p.issues.contains(&PointIssue::AllCandidatesNaN));
    let opt = p.search.as_ref().unwrap().optimum;
    assert!(opt.grounding_level.is_nan());
    assert!(opt.interval.low.is_nan() && opt.interval.high.is_nan());
    assert!(p.inversion.is_none());

    let q = by_id[&fine.id];
    assert!(!q.issues.contains(&PointIssue::AllCandidatesNaN));
    assert_eq!(q.search.as_ref().unwrap().optimum.grounding_level, 4.0);
    assert!(q.inversion.is_some());
}

#[test]
fn interrupted_search_resumes_to_the_same_result() {
    let sample = synthetic(2, 1, -0.3);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint.json");

    let mut limited = config(SearchMode::Auto);
    limited.max_rounds = Some(1);
    let mut checkpoint = SearchCheckpoint::new();
    let first = run_points(&limited, &sample.points, &mut checkpoint).unwrap();
    assert!(!first.converged);
    assert!(first.points.iter().all(|p| p.inversion.is_none()));
    write_checkpoint(&path, &mut checkpoint).unwrap();

    let mut resumed = read_checkpoint(&path).unwrap();
    let rest = run_points(&config(SearchMode::Auto), &sample.points, &mut resumed).unwrap();
    assert!(rest.converged);
    assert_eq!(rest.rounds, 2);

    let mut straight = SearchCheckpoint::new();
    run_points(&config(SearchMode::Auto), &sample.points, &mut straight).unwrap();
    for (id, state) in &straight.points {
        assert_eq!(resumed.points[id].completed, state.completed);
        assert_eq!(resumed.points[id].optimum.grounding_level, state.optimum.grounding_level);
    }
}

#[test]
fn invert_optimal_requires_a_finished_search() {
    let sample = synthetic(1, 1, -0.5);
    let invert_only = config(SearchMode::InvertOptimal);

    let mut empty = SearchCheckpoint::new();
    let err = run_points(&invert_only, &sample.points, &mut empty).unwrap_err();
    assert_eq!(err.exit_code(), 2);

    let mut partial = SearchCheckpoint::new();
    let mut limited = config(SearchMode::Auto);
    limited.max_rounds = Some(2);
    run_points(&limited, &sample.points, &mut partial).unwrap();
    assert_eq!(run_points(&invert_only, &sample.points, &mut partial).unwrap_err().exit_code(), 2);

    run_points(&config(SearchMode::Auto), &sample.points, &mut partial).unwrap();
    let output = run_points(&invert_only, &sample.points, &mut partial).unwrap();
    let optimum = partial.points[&sample.points[0].id].optimum.grounding_level;
    assert_eq!(output.points[0].inversion.as_ref().unwrap().grounding_level, Some(optimum));
}

#[test]
fn simple_linear_runs_one_inversion_without_search() {
    let sample = synthetic(1, 1, -0.5);
    let mut checkpoint = SearchCheckpoint::new();
    let output = run_points(&config(SearchMode::SimpleLinear), &sample.points, &mut checkpoint).unwrap();

    assert_eq!(output.rounds, 0);
    let p = &output.points[0];
    assert!(p.search.is_none());
    let inv = p.inversion.as_ref().unwrap();
    assert_eq!(inv.grounding_level, None);
    assert!(inv.tide.up_scale.is_none());
    assert!(inv.tide.constituents.iter().all(|c| c.up.is_some()));
    assert!(checkpoint.points[&p.id].completed.is_empty());
}

#[test]
fn external_levels_invert_listed_points_only() {
    let sample = synthetic(2, 1, -0.5);
    let (a, b) = (sample.points[0].id, sample.points[1].id);
    let mut checkpoint = SearchCheckpoint::new();
    let output = run_points(&external(&[(a, -0.4)]), &sample.points, &mut checkpoint).unwrap();

    let by_id: BTreeMap<_, _> = output.points.iter().map(|p| (p.id, p)).collect();
    assert_eq!(by_id[&a].inversion.as_ref().unwrap().grounding_level, Some(-0.4));
    assert!(by_id[&b].inversion.is_none());
}

#[test]
fn external_levels_do_not_override_the_coverage_pin() {
    let point = single_offset_point(-80.0, (0.3, -0.2));
    let config = EstimateConfig {
        coverage: CoverageCheck::MinOffsets { min_offsets: 10 },
        ..external(&[(point.id, -1.0)])
    };
    let mut checkpoint = SearchCheckpoint::new();
    let output = run_points(&config, std::slice::from_ref(&point), &mut checkpoint).unwrap();

    let estimate = &output.points[0];
    let inversion = estimate.inversion.as_ref().unwrap();
    assert_eq!(inversion.grounding_level, Some(NO_GROUNDING_LEVEL));
    assert!(estimate.issues.contains(&PointIssue::InsufficientCoverage));
}

#[test]
fn invert_optimal_pins_ineligible_points_without_a_search() {
    let point = single_offset_point(-80.0, (0.3, -0.2));
    let config = EstimateConfig {
        coverage: CoverageCheck::MinOffsets { min_offsets: 10 },
        ..config(SearchMode::InvertOptimal)
    };
    let mut checkpoint = SearchCheckpoint::new();
    let output = run_points(&config, std::slice::from_ref(&point), &mut checkpoint).unwrap();

    let estimate = &output.points[0];
    assert_eq!(estimate.inversion.as_ref().unwrap().grounding_level, Some(NO_GROUNDING_LEVEL));
    assert!(estimate.issues.contains(&PointIssue::InsufficientCoverage));
}

#[test]
fn optional_terms_append_their_parameters() {
    let sample = synthetic(1, 1, -0.5);
    let config = EstimateConfig {
        secular_variation: true,
        topo_residual: true,
        ..common::manual(&[-0.5])
    };
    let mut checkpoint = SearchCheckpoint::new();
    let output = run_points(&config, &sample.points, &mut checkpoint).unwrap();
    let inversion = output.points[0].inversion.as_ref().unwrap();
    assert!(!inversion.posterior.is_singular());

    let planned = ColumnLayout::planned(&config, config.constituents().unwrap().len());
    assert!(planned.has(Block::SecularVariation) && planned.has(Block::TopoResidual));
    assert_eq!(inversion.posterior.estimate.len(), planned.ncols());

    let tide = &inversion.tide;
    let variation = tide.secular_variation.unwrap();
    assert!(variation.iter().all(|e| e.value.is_finite() && e.sigma.is_finite()));
    let topo = tide.topo_residual.unwrap();
    assert!(topo.value.is_finite() && topo.sigma.is_finite());
}
