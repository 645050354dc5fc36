use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::{
    data::{Jet, Particle},
    optimizer::Objective,
    utils::{
        delta_phi,
        enums::{Flavor, PerFlavor},
    },
    FlowError, FlowResult, Float,
};

/// Penalty paid by a reconstructed particle that receives no truth momentum:
/// $`2\,e\,\max(\ln(p_T/p_{T,0}), 0) + c`$.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PileupPenalty {
    /// Reference pt $`p_{T,0}`$ below which only the constant is paid.
    pub pt0: Float,
    /// Logarithmic slope $`e`$.
    pub exponent: Float,
    /// Constant offset $`c`$.
    pub penalty: Float,
}

impl PileupPenalty {
    /// The penalty for an unmatched particle of transverse momentum `pt`.
    pub fn evaluate(&self, pt: Float) -> Float {
        2.0 * self.exponent * (pt / self.pt0).ln().max(0.0) + self.penalty
    }
}

/// Per-flavor pileup penalties, keyed by the flavor of the unmatched reconstructed particle.
pub type PileupConfig = PerFlavor<PileupPenalty>;

impl Default for PileupConfig {
    fn default() -> Self {
        PerFlavor::splat(PileupPenalty {
            pt0: 1.0,
            exponent: 2.0,
            penalty: 1.0,
        })
    }
}

/// Scale every nonzero column of `matrix` so that it sums to one.
pub fn normalize_columns(matrix: &mut DMatrix<Float>) {
    for mut column in matrix.column_iter_mut() {
        let sum = column.sum();
        if sum > 0.0 {
            column /= sum;
        }
    }
}

/// The individual contributions to a [`ChisqLoss`] value.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct LossBreakdown {
    /// Sum of squared, resolution-normalized pt residuals.
    pub pt: Float,
    /// Sum of squared, resolution-normalized eta residuals.
    pub eta: Float,
    /// Sum of squared, resolution-normalized phi residuals.
    pub phi: Float,
    /// Sum of penalties for unmatched reconstructed particles.
    pub pileup: Float,
}

impl LossBreakdown {
    /// The total loss.
    pub fn total(&self) -> Float {
        self.pt + self.eta + self.phi + self.pileup
    }
}

/// Chi-square between the observed reconstructed particles and the prediction obtained by
/// pushing the truth particles through a transfer matrix.
///
/// The matrix is the fixed part (single-candidate entries) with the free parameters overlaid at
/// their fit locations, normalized column by column.
#[derive(Clone, Debug)]
pub struct ChisqLoss {
    reco_pt: DVector<Float>,
    reco_eta: DVector<Float>,
    reco_phi: DVector<Float>,
    reco_dpt: DVector<Float>,
    reco_deta: DVector<Float>,
    reco_dphi: DVector<Float>,
    truth_pt: DVector<Float>,
    truth_eta: DVector<Float>,
    truth_phi: DVector<Float>,
    fixed: DMatrix<Float>,
    locations: Vec<(usize, usize)>,
    pileup: Vec<PileupPenalty>,
}

impl ChisqLoss {
    /// Build the loss. The reconstructed jet must carry resolutions.
    pub fn new(
        reco: &Jet,
        truth: &Jet,
        fixed: &DMatrix<Float>,
        locations: &[(usize, usize)],
        pileup: &PileupConfig,
    ) -> FlowResult<Self> {
        if fixed.nrows() != reco.n_part() || fixed.ncols() != truth.n_part() {
            return Err(FlowError::Custom(format!(
                "Fixed matrix is {}x{} but the jets have {} reco and {} truth particles",
                fixed.nrows(),
                fixed.ncols(),
                reco.n_part(),
                truth.n_part()
            )));
        }
        let pileup = reco
            .flavors()?
            .into_iter()
            .map(|flavor: Flavor| *pileup.get(flavor))
            .collect();
        let column = |f: fn(&Particle) -> Float| {
            DVector::from_iterator(reco.n_part(), reco.particles.iter().map(f))
        };
        Ok(Self {
            reco_pt: reco.pt_vec(),
            reco_eta: reco.eta_vec(),
            reco_phi: reco.phi_vec(),
            reco_dpt: column(|p| p.dpt),
            reco_deta: column(|p| p.deta),
            reco_dphi: column(|p| p.dphi),
            truth_pt: truth.pt_vec(),
            truth_eta: truth.eta_vec(),
            truth_phi: truth.phi_vec(),
            fixed: fixed.clone(),
            locations: locations.to_vec(),
            pileup,
        })
    }

    /// The number of free parameters.
    pub fn n_parameters(&self) -> usize {
        self.locations.len()
    }

    /// The column-normalized transfer matrix for the given parameters.
    pub fn full_matrix(&self, parameters: &[Float]) -> DMatrix<Float> {
        let mut matrix = self.fixed.clone();
        for (&(i, j), &value) in self.locations.iter().zip(parameters) {
            matrix[(i, j)] = value;
        }
        normalize_columns(&mut matrix);
        matrix
    }

    /// Evaluate each contribution separately.
    pub fn breakdown(&self, parameters: &[Float]) -> LossBreakdown {
        let matrix = self.full_matrix(parameters);
        let predicted_pt = &matrix * &self.truth_pt;
        let mut result = LossBreakdown::default();
        for i in 0..matrix.nrows() {
            let predicted = predicted_pt[i];
            if predicted <= 0.0 {
                result.pileup += self.pileup[i].evaluate(self.reco_pt[i]);
                continue;
            }
            let (weighted_eta, weighted_dphi) = matrix
                .row(i)
                .iter()
                .enumerate()
                .filter(|(_, a)| **a > 0.0)
                .fold((0.0, 0.0), |(eta, dphi), (j, a)| {
                    let w = a * self.truth_pt[j];
                    (
                        eta + w * self.truth_eta[j],
                        dphi + w * delta_phi(self.truth_phi[j], self.reco_phi[i]),
                    )
                });
            let pt = (predicted - self.reco_pt[i]) / self.reco_dpt[i];
            let eta = (weighted_eta / predicted - self.reco_eta[i]) / self.reco_deta[i];
            let phi = (weighted_dphi / predicted) / self.reco_dphi[i];
            result.pt += pt * pt;
            result.eta += eta * eta;
            result.phi += phi * phi;
        }
        result
    }
}

impl Objective for ChisqLoss {
    fn evaluate(&self, parameters: &[Float]) -> Float {
        self.breakdown(parameters).total()
    }
}
