//! Interpretation of an estimated parameter vector.
//!
//! The inversion works on raw cos/sin coefficients; reporting wants amplitudes,
//! phases, one-sigma uncertainties and residual summaries. All conversions read
//! column positions from the [`ColumnLayout`], never from hard-coded offsets.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::domain::{DataSource, OffsetField, ResidualSummary, nan_as_null};
use crate::math::inversion::{ModelPosterior, residual, rms};
use crate::math::tides::Constituent;
use crate::models::design::{Block, DesignMatrix};

/// A value with its one-sigma uncertainty.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    #[serde(with = "nan_as_null")]
    pub value: f64,
    #[serde(with = "nan_as_null")]
    pub sigma: f64,
}

impl Estimate {
    const NAN: Estimate = Estimate {
        value: f64::NAN,
        sigma: f64::NAN,
    };
}

/// Amplitude (m) and phase (degrees) of one displacement component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AmpPhase {
    pub amplitude: Estimate,
    pub phase_deg: Estimate,
}

/// Tidal response of one constituent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstituentParams {
    pub name: String,
    pub east: AmpPhase,
    pub north: AmpPhase,
    /// Only present when the vertical tide is modelled by constituents.
    pub up: Option<AmpPhase>,
}

/// Physical parameters derived from a posterior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TideParams {
    /// Secular velocity (e, n, u) in m/day.
    pub secular_velocity: [Estimate; 3],
    pub constituents: Vec<ConstituentParams>,
    pub up_scale: Option<Estimate>,
    pub secular_variation: Option<[Estimate; 3]>,
    pub topo_residual: Option<Estimate>,
}

/// Residual statistics for one data source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceResidual {
    pub count: usize,
    #[serde(with = "nan_as_null")]
    pub rms: f64,
}

fn scalar(post: &ModelPosterior, i: usize) -> Estimate {
    Estimate {
        value: post.estimate[i],
        sigma: post.sigma(i),
    }
}

/// Convert a `(cos, sin)` coefficient pair at columns `(ic, is)` to amplitude/phase.
///
/// Uncertainties use first-order propagation of the 2×2 posterior block.
fn amp_phase(post: &ModelPosterior, ic: usize, is: usize) -> AmpPhase {
    let c = post.estimate[ic];
    let s = post.estimate[is];
    let amp = (c * c + s * s).sqrt();
    if !(amp.is_finite() && amp > 0.0) {
        return AmpPhase {
            amplitude: Estimate { value: amp, sigma: f64::NAN },
            phase_deg: Estimate::NAN,
        };
    }

    let cov = &post.covariance;
    let (vcc, vss, vcs) = (cov[(ic, ic)], cov[(is, is)], cov[(ic, is)]);

    // d amp = (c dc + s ds) / amp; d phase = (c ds − s dc) / amp²
    let var_amp = (c * c * vcc + s * s * vss + 2.0 * c * s * vcs) / (amp * amp);
    let amp2 = amp * amp;
    let var_phase = (s * s * vcc + c * c * vss - 2.0 * c * s * vcs) / (amp2 * amp2);

    AmpPhase {
        amplitude: Estimate {
            value: amp,
            sigma: var_amp.max(0.0).sqrt(),
        },
        phase_deg: Estimate {
            value: s.atan2(c).to_degrees(),
            sigma: var_phase.max(0.0).sqrt().to_degrees(),
        },
    }
}

/// Convert a posterior to physical tidal parameters.
pub fn tide_params(dm: &DesignMatrix, tides: &[Constituent], post: &ModelPosterior) -> TideParams {
    let layout = dm.layout();
    let sec = layout.range(Block::SecularVelocity).map(|r| r.start).unwrap_or(0);
    let secular_velocity = [scalar(post, sec), scalar(post, sec + 1), scalar(post, sec + 2)];

    let horizontal = layout.range(Block::HorizontalTides);
    let vertical = layout.range(Block::VerticalTides);

    let constituents = tides
        .iter()
        .enumerate()
        .filter_map(|(j, c)| {
            let h = horizontal.as_ref()?.start + 4 * j;
            let up = vertical
                .as_ref()
                .map(|v| amp_phase(post, v.start + 2 * j, v.start + 2 * j + 1));
            Some(ConstituentParams {
                name: c.name.to_string(),
                east: amp_phase(post, h, h + 1),
                north: amp_phase(post, h + 2, h + 3),
                up,
            })
        })
        .collect();

    let up_scale = layout.range(Block::UpScale).map(|r| scalar(post, r.start));
    let secular_variation = layout
        .range(Block::SecularVariation)
        .map(|r| [scalar(post, r.start), scalar(post, r.start + 1), scalar(post, r.start + 2)]);
    let topo_residual = layout.range(Block::TopoResidual).map(|r| scalar(post, r.start));

    TideParams {
        secular_velocity,
        constituents,
        up_scale,
        secular_variation,
        topo_residual,
    }
}

/// Up-scale value of a posterior (NaN when the block is absent or singular).
pub fn up_scale(dm: &DesignMatrix, post: &ModelPosterior) -> f64 {
    dm.layout()
        .range(Block::UpScale)
        .map(|r| post.estimate[r.start])
        .unwrap_or(f64::NAN)
}

/// RMS residuals of the secular-only and the full model.
pub fn residual_summary(dm: &DesignMatrix, d: &DVector<f64>, post: &ModelPosterior) -> ResidualSummary {
    if post.is_singular() {
        return ResidualSummary::NAN;
    }
    let full = residual(dm.matrix(), d, &post.estimate);

    let secular = match dm.layout().range(Block::SecularVelocity) {
        Some(r) => {
            let g_sec: DMatrix<f64> = dm.matrix().columns(r.start, r.len()).into_owned();
            let m_sec: DVector<f64> = post.estimate.rows(r.start, r.len()).into_owned();
            rms(&residual(&g_sec, d, &m_sec))
        }
        None => f64::NAN,
    };

    ResidualSummary {
        secular,
        tidal: rms(&full),
    }
}

/// Full-model residual statistics per data source.
pub fn residual_by_source(
    dm: &DesignMatrix,
    d: &DVector<f64>,
    post: &ModelPosterior,
    offsets: &[OffsetField],
) -> BTreeMap<DataSource, SourceResidual> {
    let r = residual(dm.matrix(), d, &post.estimate);
    let mut out = BTreeMap::new();
    for source in DataSource::ALL {
        let values: Vec<f64> = offsets
            .iter()
            .zip(r.iter())
            .filter(|(o, _)| o.source == source)
            .map(|(_, v)| *v)
            .collect();
        if values.is_empty() {
            continue;
        }
        let count = values.len();
        out.insert(
            source,
            SourceResidual {
                count,
                rms: rms(&DVector::from_vec(values)),
            },
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn posterior(estimate: &[f64], var: f64) -> ModelPosterior {
        let n = estimate.len();
        ModelPosterior {
            covariance: DMatrix::from_diagonal_element(n, n, var),
            estimate: DVector::from_row_slice(estimate),
            log_det_precision: 0.0,
        }
    }

    #[test]
    fn amplitude_and_phase_from_cos_sin() {
        let post = posterior(&[3.0, 4.0], 0.01);
        let ap = amp_phase(&post, 0, 1);
        assert!((ap.amplitude.value - 5.0).abs() < 1e-12);
        assert!((ap.phase_deg.value - 4.0_f64.atan2(3.0).to_degrees()).abs() < 1e-12);
        // Isotropic covariance: amplitude sigma equals the coefficient sigma.
        assert!((ap.amplitude.sigma - 0.1).abs() < 1e-12);
        assert!((ap.phase_deg.sigma - (0.1_f64 / 5.0).to_degrees()).abs() < 1e-9);
    }

    #[test]
    fn singular_posterior_gives_nan_amplitude() {
        let post = ModelPosterior::singular(2);
        let ap = amp_phase(&post, 0, 1);
        assert!(ap.amplitude.value.is_nan());
        assert!(ap.phase_deg.value.is_nan());
    }
}
