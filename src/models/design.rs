//! Design matrix construction.
//!
//! The base matrix maps secular velocity and tidal cos/sin coefficients to the
//! observed offsets. Optional blocks are appended in a fixed order:
//!
//! 1. base (secular velocity, horizontal tides, vertical tides)
//! 2. grounding level (replaces the vertical tidal block with one up-scale column)
//! 3. secular variation
//! 4. topographic residual
//!
//! Later blocks assume the column positions of earlier ones, so every modifier
//! checks the layout and refuses to run out of order. Modifiers never touch their
//! input: they return a new [`DesignMatrix`], which lets one base matrix per
//! point be reused for every grounding-level candidate.

use std::ops::Range;

use nalgebra::{DMatrix, DVector};

use crate::domain::{EstimateConfig, OffsetField, PointData, PriorConfig};
use crate::error::AppError;
use crate::math::tides::{Constituent, days_since_reference};

/// A contiguous group of columns with one meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Block {
    SecularVelocity,
    HorizontalTides,
    VerticalTides,
    UpScale,
    SecularVariation,
    TopoResidual,
}

impl Block {
    /// Position in the required modification order (base blocks share 0).
    fn order(self) -> u8 {
        match self {
            Block::SecularVelocity | Block::HorizontalTides | Block::VerticalTides => 0,
            Block::UpScale => 1,
            Block::SecularVariation => 2,
            Block::TopoResidual => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Block::SecularVelocity => "secular velocity",
            Block::HorizontalTides => "horizontal tides",
            Block::VerticalTides => "vertical tides",
            Block::UpScale => "grounding level",
            Block::SecularVariation => "secular variation",
            Block::TopoResidual => "topo residual",
        }
    }
}

/// Column ranges of every block present in a matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnLayout {
    blocks: Vec<(Block, Range<usize>)>,
    n_tides: usize,
}

impl ColumnLayout {
    fn base(n_tides: usize) -> Self {
        let mut layout = Self {
            blocks: Vec::new(),
            n_tides,
        };
        layout.push(Block::SecularVelocity, 3);
        layout.push(Block::HorizontalTides, 4 * n_tides);
        layout.push(Block::VerticalTides, 2 * n_tides);
        layout
    }

    /// The layout every point will end up with for a given configuration.
    ///
    /// Used to build the model prior once per run instead of once per candidate.
    pub fn planned(config: &EstimateConfig, n_tides: usize) -> Self {
        let mut layout = Self::base(n_tides);
        if config.uses_grounding_level() {
            layout = layout.without(Block::VerticalTides);
            layout.push(Block::UpScale, 1);
        }
        if config.secular_variation {
            layout.push(Block::SecularVariation, 3);
        }
        if config.topo_residual {
            layout.push(Block::TopoResidual, 1);
        }
        layout
    }

    fn push(&mut self, block: Block, width: usize) {
        let start = self.ncols();
        self.blocks.push((block, start..start + width));
    }

    fn without(&self, block: Block) -> Self {
        let mut out = Self {
            blocks: Vec::new(),
            n_tides: self.n_tides,
        };
        for (b, r) in &self.blocks {
            if *b != block {
                out.push(*b, r.len());
            }
        }
        out
    }

    pub fn ncols(&self) -> usize {
        self.blocks.last().map(|(_, r)| r.end).unwrap_or(0)
    }

    pub fn range(&self, block: Block) -> Option<Range<usize>> {
        self.blocks
            .iter()
            .find(|(b, _)| *b == block)
            .map(|(_, r)| r.clone())
    }

    pub fn has(&self, block: Block) -> bool {
        self.range(block).is_some()
    }

    fn last_order(&self) -> u8 {
        self.blocks.iter().map(|(b, _)| b.order()).max().unwrap_or(0)
    }
}

/// A design matrix together with its column layout.
#[derive(Debug, Clone, PartialEq)]
pub struct DesignMatrix {
    matrix: DMatrix<f64>,
    layout: ColumnLayout,
}

impl DesignMatrix {
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    pub fn layout(&self) -> &ColumnLayout {
        &self.layout
    }

    /// Append a block after checking the required order.
    fn append(&self, block: Block, columns: DMatrix<f64>) -> Result<DesignMatrix, AppError> {
        if self.layout.has(block) {
            return Err(AppError::config(
                format!("Design matrix already has the {} block.", block.label()),
            ));
        }
        if self.layout.last_order() > block.order() {
            return Err(AppError::config(format!(
                "The {} block must be added before any later optional block.",
                block.label()
            )));
        }
        if columns.nrows() != self.matrix.nrows() {
            return Err(AppError::internal("Appended columns do not match the row count."));
        }

        let width = columns.ncols();
        let old = self.matrix.ncols();
        let mut matrix = DMatrix::<f64>::zeros(self.matrix.nrows(), old + width);
        matrix.columns_mut(0, old).copy_from(&self.matrix);
        matrix.columns_mut(old, width).copy_from(&columns);

        let mut layout = self.layout.clone();
        layout.push(block, width);
        Ok(DesignMatrix { matrix, layout })
    }
}

/// Build the base matrix for one point.
///
/// Columns: secular velocity `(e, n, u)`, then per constituent
/// `(e_cos, e_sin, n_cos, n_sin)`, then per constituent `(u_cos, u_sin)`.
pub fn build(point: &PointData, tides: &[Constituent]) -> DesignMatrix {
    let layout = ColumnLayout::base(tides.len());
    let n = point.offsets.len();
    let k = tides.len();
    let mut g = DMatrix::<f64>::zeros(n, layout.ncols());

    for (i, o) in point.offsets.iter().enumerate() {
        let t_m = days_since_reference(o.master_time);
        let t_s = days_since_reference(o.slave_time);
        let dt = t_s - t_m;
        let [pe, pn, pu] = o.projection;

        g[(i, 0)] = pe * dt;
        g[(i, 1)] = pn * dt;
        g[(i, 2)] = pu * dt;

        for (j, c) in tides.iter().enumerate() {
            let (dc, ds) = c.differential(t_m, t_s);
            let h = 3 + 4 * j;
            g[(i, h)] = pe * dc;
            g[(i, h + 1)] = pe * ds;
            g[(i, h + 2)] = pn * dc;
            g[(i, h + 3)] = pn * ds;

            let v = 3 + 4 * k + 2 * j;
            g[(i, v)] = pu * dc;
            g[(i, v + 1)] = pu * ds;
        }
    }

    DesignMatrix { matrix: g, layout }
}

/// Vertical tide heights at both epochs of every offset.
#[derive(Debug, Clone, PartialEq)]
pub struct UpDisplacements {
    pub master: Vec<f64>,
    pub slave: Vec<f64>,
}

impl UpDisplacements {
    pub fn of(offsets: &[OffsetField]) -> Self {
        Self {
            master: offsets.iter().map(|o| o.tide_master).collect(),
            slave: offsets.iter().map(|o| o.tide_slave).collect(),
        }
    }
}

/// Replace the vertical tidal block with one up-scale column for `grounding_level`.
///
/// Tide heights below the grounding level are clipped to it, because grounded
/// ice does not follow the tide down. The caller resolves scalar and per-point
/// candidates to a single value for this point before calling.
pub fn modify_for_grounding_level(
    base: &DesignMatrix,
    offsets: &[OffsetField],
    up: &UpDisplacements,
    grounding_level: f64,
) -> Result<DesignMatrix, AppError> {
    let Some(vertical) = base.layout.range(Block::VerticalTides) else {
        return Err(AppError::config(
            "Grounding level must be applied to a base matrix with vertical tidal columns.",
        ));
    };
    if base.layout.last_order() > 0 {
        return Err(AppError::config(
            "Grounding level must be applied before secular-variation and topo-residual columns.",
        ));
    }

    let n = base.matrix.nrows();
    if offsets.len() != n || up.master.len() != n || up.slave.len() != n {
        return Err(AppError::internal("Offsets do not match the design matrix rows."));
    }

    let stripped = base.matrix.clone().remove_columns(vertical.start, vertical.len());
    let layout = base.layout.without(Block::VerticalTides);
    let reduced = DesignMatrix {
        matrix: stripped,
        layout,
    };

    let column = DMatrix::from_fn(n, 1, |i, _| {
        let clipped_m = up.master[i].max(grounding_level);
        let clipped_s = up.slave[i].max(grounding_level);
        offsets[i].projection[2] * (clipped_s - clipped_m)
    });

    reduced.append(Block::UpScale, column)
}

/// An optional block selected at configuration time.
pub trait ColumnModifier: Send + Sync {
    fn block(&self) -> Block;

    /// The new columns (one row per offset).
    fn columns(&self, point: &PointData) -> DMatrix<f64>;

    fn apply(&self, matrix: &DesignMatrix, point: &PointData) -> Result<DesignMatrix, AppError> {
        matrix.append(self.block(), self.columns(point))
    }
}

/// Constant change of secular velocity over the observation span.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecularVariation;

impl ColumnModifier for SecularVariation {
    fn block(&self) -> Block {
        Block::SecularVariation
    }

    fn columns(&self, point: &PointData) -> DMatrix<f64> {
        let t0 = point
            .offsets
            .iter()
            .map(|o| days_since_reference(o.master_time).min(days_since_reference(o.slave_time)))
            .fold(f64::INFINITY, f64::min);

        DMatrix::from_fn(point.offsets.len(), 3, |i, c| {
            let o = &point.offsets[i];
            let tau_m = days_since_reference(o.master_time) - t0;
            let tau_s = days_since_reference(o.slave_time) - t0;
            o.projection[c] * (tau_s * tau_s - tau_m * tau_m) / 2.0
        })
    }
}

/// DEM error term (one column of per-offset DEM factors).
#[derive(Debug, Clone, Copy, Default)]
pub struct TopoResidual;

impl ColumnModifier for TopoResidual {
    fn block(&self) -> Block {
        Block::TopoResidual
    }

    fn columns(&self, point: &PointData) -> DMatrix<f64> {
        // A missing factor poisons only this point (singular posterior), not the run.
        DMatrix::from_fn(point.offsets.len(), 1, |i, _| {
            point.dem_factors.get(i).copied().unwrap_or(f64::NAN)
        })
    }
}

/// Ordered list of the optional modifiers enabled for a run.
pub struct ModifierChain {
    modifiers: Vec<Box<dyn ColumnModifier>>,
}

impl ModifierChain {
    pub fn from_config(config: &EstimateConfig) -> Self {
        let mut modifiers: Vec<Box<dyn ColumnModifier>> = Vec::new();
        if config.secular_variation {
            modifiers.push(Box::new(SecularVariation));
        }
        if config.topo_residual {
            modifiers.push(Box::new(TopoResidual));
        }
        modifiers.sort_by_key(|m| m.block().order());
        Self { modifiers }
    }

    pub fn apply(&self, matrix: &DesignMatrix, point: &PointData) -> Result<DesignMatrix, AppError> {
        let mut out = matrix.clone();
        for m in &self.modifiers {
            out = m.apply(&out, point)?;
        }
        Ok(out)
    }
}

/// Diagonal model prior precision for a layout.
pub fn model_prior(layout: &ColumnLayout, prior: &PriorConfig) -> DMatrix<f64> {
    let mut diag = DVector::<f64>::zeros(layout.ncols());
    for (block, sigma) in [
        (Block::SecularVelocity, prior.secular_velocity),
        (Block::HorizontalTides, prior.horizontal_tide),
        (Block::VerticalTides, prior.vertical_tide),
        (Block::UpScale, prior.up_scale),
        (Block::SecularVariation, prior.secular_variation),
        (Block::TopoResidual, prior.topo_residual),
    ] {
        let (Some(range), Some(s)) = (layout.range(block), sigma) else {
            continue;
        };
        for i in range {
            diag[i] = 1.0 / (s * s);
        }
    }
    DMatrix::from_diagonal(&diag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DataSource, PointId};
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn offset(day_m: u32, day_s: u32, tide_m: f64, tide_s: f64) -> OffsetField {
        let at = |d: u32| {
            NaiveDate::from_ymd_opt(2018, 3, d)
                .unwrap()
                .and_hms_opt(6, 30, 0)
                .unwrap()
        };
        OffsetField {
            source: DataSource::Csk,
            master_time: at(day_m),
            slave_time: at(day_s),
            offset: 0.0,
            sigma: 0.05,
            projection: [0.6, 0.0, 0.8],
            tide_master: tide_m,
            tide_slave: tide_s,
        }
    }

    fn point() -> PointData {
        PointData {
            id: PointId::new(-83.0, -78.0),
            offsets: vec![
                offset(1, 2, -1.0, 0.5),
                offset(2, 4, 0.5, -2.0),
                offset(3, 7, 1.2, -0.3),
            ],
            dem_factors: vec![0.1, 0.2, 0.3],
            max_offset_pairs: BTreeMap::new(),
        }
    }

    fn tides() -> Vec<Constituent> {
        vec![Constituent::lookup("M2").unwrap(), Constituent::lookup("K1").unwrap()]
    }

    #[test]
    fn base_layout_has_expected_width() {
        let dm = build(&point(), &tides());
        assert_eq!(dm.matrix().ncols(), 3 + 8 + 4);
        assert_eq!(dm.layout().range(Block::VerticalTides), Some(11..15));
    }

    #[test]
    fn grounding_level_clips_tides_and_leaves_base_untouched() {
        let p = point();
        let base = build(&p, &tides());
        let before = base.clone();
        let up = UpDisplacements::of(&p.offsets);

        let dm = modify_for_grounding_level(&base, &p.offsets, &up, -0.5).unwrap();
        assert_eq!(base, before);
        assert!(!dm.layout().has(Block::VerticalTides));

        let col = dm.layout().range(Block::UpScale).unwrap().start;
        // Offset 0: max(-1,-0.5)=-0.5 -> 0.5: diff 1.0, times proj_u 0.8.
        assert!((dm.matrix()[(0, col)] - 0.8).abs() < 1e-12);
        // Offset 1: 0.5 -> max(-2,-0.5)=-0.5: diff -1.0.
        assert!((dm.matrix()[(1, col)] + 0.8).abs() < 1e-12);
    }

    #[test]
    fn level_above_all_tides_gives_zero_column() {
        let p = point();
        let base = build(&p, &tides());
        let up = UpDisplacements::of(&p.offsets);
        let dm = modify_for_grounding_level(&base, &p.offsets, &up, 4.0).unwrap();
        let col = dm.layout().range(Block::UpScale).unwrap().start;
        assert!(dm.matrix().column(col).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn modifiers_compose_in_required_order() {
        let p = point();
        let config = EstimateConfig {
            secular_variation: true,
            topo_residual: true,
            ..EstimateConfig::default()
        };
        let chain = ModifierChain::from_config(&config);
        let base = build(&p, &tides());
        let up = UpDisplacements::of(&p.offsets);
        let grounded = modify_for_grounding_level(&base, &p.offsets, &up, -1.0).unwrap();
        let full = chain.apply(&grounded, &p).unwrap();

        assert_eq!(full.layout(), &ColumnLayout::planned(&config, 2));
        let topo = full.layout().range(Block::TopoResidual).unwrap();
        assert_eq!(topo.end, full.matrix().ncols());
        assert!((full.matrix()[(2, topo.start)] - 0.3).abs() < 1e-12);
    }

    #[test]
    fn out_of_order_modification_is_rejected() {
        let p = point();
        let base = build(&p, &tides());
        let with_topo = TopoResidual.apply(&base, &p).unwrap();
        let up = UpDisplacements::of(&p.offsets);

        assert!(modify_for_grounding_level(&with_topo, &p.offsets, &up, 0.0).is_err());
        assert!(SecularVariation.apply(&with_topo, &p).is_err());
        assert!(TopoResidual.apply(&with_topo, &p).is_err());
    }

    #[test]
    fn prior_leaves_uninformative_blocks_at_zero() {
        let config = EstimateConfig::default();
        let layout = ColumnLayout::planned(&config, 2);
        let prior = PriorConfig {
            up_scale: None,
            ..PriorConfig::default()
        };
        let inv_cm = model_prior(&layout, &prior);
        let up = layout.range(Block::UpScale).unwrap().start;
        assert_eq!(inv_cm[(up, up)], 0.0);
        assert!((inv_cm[(0, 0)] - 0.25).abs() < 1e-12);
    }
}
