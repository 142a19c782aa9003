//! Bayesian linear inversion.
//!
//! For a design matrix `G`, data `d`, data precision `C_d⁻¹` and model prior
//! precision `C_m⁻¹` (zero prior mean) we compute:
//!
//! ```text
//! C_m,p⁻¹ = C_m⁻¹ + Gᵀ C_d⁻¹ G
//! C_m,p   = (C_m,p⁻¹)⁻¹
//! m       = C_m,p Gᵀ C_d⁻¹ d
//! ```
//!
//! Implementation choices:
//! - The posterior precision is factorized with Cholesky. A failed factorization,
//!   a non-finite inverse, or a reciprocal condition estimate below
//!   [`RCOND_MIN`] produces an all-NaN posterior instead of an error: some
//!   grounding levels legitimately make `G` rank deficient and the search must
//!   keep going.
//! - The model likelihood is the Gaussian evidence `p(d)`. Directions with zero
//!   prior precision contribute an improper flat prior whose constant is the same
//!   for every candidate of a point, so it is dropped (pseudo log-determinant).

use nalgebra::{DMatrix, DVector, SymmetricEigen};

/// Below this (squared Cholesky diagonal ratio) the precision is treated as singular.
pub const RCOND_MIN: f64 = 1e-12;

/// Eigenvalues at or below this fraction of the largest one count as zero.
const EIG_REL_TOL: f64 = 1e-12;

/// Posterior of one inversion.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPosterior {
    pub covariance: DMatrix<f64>,
    pub estimate: DVector<f64>,
    /// `log|C_m,p⁻¹|` (NaN when singular).
    pub log_det_precision: f64,
}

impl ModelPosterior {
    /// The "no information" posterior returned for singular problems.
    pub fn singular(n_params: usize) -> Self {
        Self {
            covariance: DMatrix::from_element(n_params, n_params, f64::NAN),
            estimate: DVector::from_element(n_params, f64::NAN),
            log_det_precision: f64::NAN,
        }
    }

    pub fn is_singular(&self) -> bool {
        !self.log_det_precision.is_finite() || self.estimate.iter().any(|v| !v.is_finite())
    }

    /// Marginal one-sigma of parameter `i`.
    pub fn sigma(&self, i: usize) -> f64 {
        self.covariance[(i, i)].max(0.0).sqrt()
    }
}

/// Build a diagonal data precision from per-observation sigmas.
pub fn data_precision(sigmas: &[f64]) -> DMatrix<f64> {
    let diag: Vec<f64> = sigmas
        .iter()
        .map(|&s| if s.is_finite() && s > 0.0 { 1.0 / (s * s) } else { f64::NAN })
        .collect();
    DMatrix::from_diagonal(&DVector::from_vec(diag))
}

/// Solve for the posterior covariance and MAP estimate.
pub fn invert(
    g: &DMatrix<f64>,
    d: &DVector<f64>,
    inv_cd: &DMatrix<f64>,
    inv_cm: &DMatrix<f64>,
) -> ModelPosterior {
    let p = g.ncols();
    if g.nrows() != d.len() || inv_cd.shape() != (d.len(), d.len()) || inv_cm.shape() != (p, p) {
        return ModelPosterior::singular(p);
    }

    let gt_icd = g.transpose() * inv_cd;
    let precision = inv_cm + &gt_icd * g;
    if precision.iter().any(|v| !v.is_finite()) {
        return ModelPosterior::singular(p);
    }

    let Some(chol) = precision.cholesky() else {
        return ModelPosterior::singular(p);
    };

    // Squared ratio of the Cholesky diagonal approximates the reciprocal
    // condition number of the precision.
    let l = chol.l_dirty();
    let (mut lmin, mut lmax) = (f64::INFINITY, 0.0_f64);
    for i in 0..p {
        let v = l[(i, i)];
        if !v.is_finite() {
            return ModelPosterior::singular(p);
        }
        lmin = lmin.min(v);
        lmax = lmax.max(v);
    }
    if p > 0 && (lmin <= 0.0 || (lmin / lmax).powi(2) < RCOND_MIN) {
        return ModelPosterior::singular(p);
    }
    let log_det_precision = 2.0 * (0..p).map(|i| l[(i, i)].ln()).sum::<f64>();

    let covariance = chol.inverse();
    let estimate = &covariance * (gt_icd * d);
    if covariance.iter().any(|v| !v.is_finite()) || estimate.iter().any(|v| !v.is_finite()) {
        return ModelPosterior::singular(p);
    }

    ModelPosterior {
        covariance,
        estimate,
        log_det_precision,
    }
}

/// `d − G m`.
pub fn residual(g: &DMatrix<f64>, d: &DVector<f64>, m: &DVector<f64>) -> DVector<f64> {
    d - g * m
}

/// Root-mean-square of a vector (NaN for empty or non-finite input).
pub fn rms(v: &DVector<f64>) -> f64 {
    if v.is_empty() {
        return f64::NAN;
    }
    let ss: f64 = v.iter().map(|x| x * x).sum();
    (ss / v.len() as f64).sqrt()
}

/// Log-determinant over the strictly positive eigenvalues of a symmetric matrix.
pub fn pseudo_log_det(m: &DMatrix<f64>) -> f64 {
    if m.is_empty() {
        return 0.0;
    }
    if m.iter().any(|v| !v.is_finite()) {
        return f64::NAN;
    }
    let eig = SymmetricEigen::new(m.clone());
    let max = eig.eigenvalues.iter().copied().fold(0.0_f64, f64::max);
    if max <= 0.0 {
        return 0.0;
    }
    eig.eigenvalues
        .iter()
        .filter(|&&v| v > max * EIG_REL_TOL)
        .map(|v| v.ln())
        .sum()
}

/// Gaussian log-evidence of `d` under the prior and noise model.
///
/// ```text
/// log p(d) = −½ (rᵀ C_d⁻¹ r + mᵀ C_m⁻¹ m)
///            + ½ log|C_d⁻¹| + ½ log⁺|C_m⁻¹| − ½ log|C_m,p⁻¹| − (n/2) log 2π
/// ```
///
/// Each precision comes paired with its (pseudo) log-determinant, which does not
/// depend on the candidate and is computed once by the caller.
pub fn log_evidence(
    g: &DMatrix<f64>,
    d: &DVector<f64>,
    (inv_cd, log_det_cd_inv): (&DMatrix<f64>, f64),
    (inv_cm, log_det_cm_inv): (&DMatrix<f64>, f64),
    posterior: &ModelPosterior,
) -> f64 {
    if posterior.is_singular() {
        return f64::NAN;
    }
    let m = &posterior.estimate;
    let r = residual(g, d, m);

    let data_term = (r.transpose() * inv_cd * &r)[(0, 0)];
    let model_term = (m.transpose() * inv_cm * m)[(0, 0)];

    let n = d.len() as f64;
    let value = -0.5 * (data_term + model_term) + 0.5 * log_det_cd_inv + 0.5 * log_det_cm_inv
        - 0.5 * posterior.log_det_precision
        - 0.5 * n * (2.0 * std::f64::consts::PI).ln();

    if value.is_finite() { value } else { f64::NAN }
}
