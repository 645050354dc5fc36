use std::fmt::Display;

use log::{debug, trace};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::{
    data::{Jet, Particle},
    filter::CandidateFilter,
    loss::{normalize_columns, ChisqLoss, PileupConfig},
    optimizer::{FitStatus, LbfgsbOptimizer, Objective, Optimizer},
    prefit::Prefitter,
    recovery::{Recovery, TrackPropagator},
    refine::{MatchMap, RefinerStrategy},
    uncertainty::UncertaintyModel,
    utils::enums::ParticleFilter,
    FlowError, FlowResult, Float, MatchingConfig,
};

/// Post-fit refinement settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefitConfig {
    /// Floating entries whose normalized value falls below this are fixed at zero.
    pub clip_value: Float,
    /// Maximum number of clipping rounds.
    pub max_refit: usize,
    /// Truth particles greedy dropping may try.
    pub drop_truth: ParticleFilter,
    /// Reconstructed particles greedy dropping may try.
    pub drop_reco: ParticleFilter,
    /// Accept a reco-side drop even if it leaves another truth particle unmatched.
    pub allow_induced_loss: bool,
}

impl Default for RefitConfig {
    fn default() -> Self {
        Self {
            clip_value: 0.01,
            max_refit: 10,
            drop_truth: ParticleFilter::All,
            drop_reco: ParticleFilter::All,
            allow_induced_loss: false,
        }
    }
}

/// The stages a [`Matcher`] goes through, in order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatcherState {
    /// Components validated, nothing computed.
    Constructed,
    /// Reconstructed resolutions assigned.
    UncertaintiesFilled,
    /// Fixed entries and fit locations known.
    PrefitDone,
    /// Loss function built.
    LossBuilt,
    /// One optimizer parameter per fit location.
    OptimizerInitialized,
    /// First optimizer pass done.
    Minimized,
    /// Greedy dropping and clipping done.
    Refined,
}

impl MatcherState {
    fn next(&self) -> Option<Self> {
        match self {
            Self::Constructed => Some(Self::UncertaintiesFilled),
            Self::UncertaintiesFilled => Some(Self::PrefitDone),
            Self::PrefitDone => Some(Self::LossBuilt),
            Self::LossBuilt => Some(Self::OptimizerInitialized),
            Self::OptimizerInitialized => Some(Self::Minimized),
            Self::Minimized => Some(Self::Refined),
            Self::Refined => None,
        }
    }
}

impl Display for MatcherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatcherState::Constructed => write!(f, "Constructed"),
            MatcherState::UncertaintiesFilled => write!(f, "Uncertainties Filled"),
            MatcherState::PrefitDone => write!(f, "Prefit Done"),
            MatcherState::LossBuilt => write!(f, "Loss Built"),
            MatcherState::OptimizerInitialized => write!(f, "Optimizer Initialized"),
            MatcherState::Minimized => write!(f, "Minimized"),
            MatcherState::Refined => write!(f, "Refined"),
        }
    }
}

/// Which side of the transfer matrix a refinement step acts on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Side {
    /// Columns (generator-level particles).
    Truth,
    /// Rows (reconstructed particles).
    Reco,
}

/// What post-fit refinement changed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RefineSummary {
    /// Truth particles removed by greedy dropping.
    pub truth_dropped: usize,
    /// Reconstructed particles removed by greedy dropping.
    pub reco_dropped: usize,
    /// Entries fixed at zero by clipping.
    pub clipped: usize,
    /// Accepted clipping rounds.
    pub clip_rounds: usize,
}

/// Everything a finished [`Matcher`] produces.
#[derive(Clone, Debug)]
pub struct MatchResult {
    /// Energy-conserving transfer matrix, see [`Matcher::ptrans`].
    pub ptrans: DMatrix<Float>,
    /// Column-normalized transfer matrix, see [`Matcher::rawmat`].
    pub rawmat: DMatrix<Float>,
    /// Final loss value.
    pub chisq: Float,
    /// Loss value after the first optimizer pass, before refinement.
    pub unrefined_chisq: Float,
    /// Whether every accepted minimization converged.
    pub converged: bool,
    /// (reco, truth) entries that were optimized.
    pub fit_locations: Vec<(usize, usize)>,
    /// Which of `fit_locations` are still floating.
    pub floating: Vec<bool>,
    /// What refinement changed.
    pub refinement: RefineSummary,
}

impl MatchResult {
    /// The number of fit locations left floating after refinement.
    pub fn n_floating(&self) -> usize {
        self.floating.iter().filter(|&&f| f).count()
    }
}

/// Fits the transfer matrix between one reconstructed jet and one truth jet.
///
/// The matcher works on its own copy of both jets; resolutions are assigned to that copy only.
/// Steps must be run in order ([`Matcher::fill_uncertainties`], [`Matcher::do_prefit`],
/// [`Matcher::build_loss`], [`Matcher::initialize_optimizer`], [`Matcher::minimize`]), or all at
/// once with [`Matcher::fit`]. Each step may be repeated, which recomputes the same result.
#[derive(Clone)]
pub struct Matcher {
    reco: Jet,
    truth: Jet,
    uncertainty: UncertaintyModel,
    filter: CandidateFilter,
    prefitter: Prefitter,
    refiner: RefinerStrategy,
    recovery: Recovery,
    pileup: PileupConfig,
    refit: RefitConfig,
    prototype: Box<dyn Optimizer>,
    fixed: DMatrix<Float>,
    locations: Vec<(usize, usize)>,
    floating: Vec<bool>,
    loss: Option<ChisqLoss>,
    optimizer: Option<Box<dyn Optimizer>>,
    status: Option<FitStatus>,
    unrefined_chisq: Option<Float>,
    converged: bool,
    refinement: RefineSummary,
    state: MatcherState,
}

impl Matcher {
    /// Validate `config` and take a copy of both jets.
    pub fn new(reco: &Jet, truth: &Jet, config: &MatchingConfig) -> FlowResult<Self> {
        Ok(Self {
            reco: reco.clone(),
            truth: truth.clone(),
            uncertainty: UncertaintyModel::new(&config.uncertainty)?,
            filter: CandidateFilter::new(&config.filter)?,
            prefitter: Prefitter::new(&config.prefit),
            refiner: config.refiner,
            recovery: Recovery::new(&config.recovery)?,
            pileup: config.pileup.clone(),
            refit: config.refit.clone(),
            prototype: Box::new(LbfgsbOptimizer::new(&config.minimizer)),
            fixed: DMatrix::zeros(reco.n_part(), truth.n_part()),
            locations: Vec::new(),
            floating: Vec::new(),
            loss: None,
            optimizer: None,
            status: None,
            unrefined_chisq: None,
            converged: true,
            refinement: RefineSummary::default(),
            state: MatcherState::Constructed,
        })
    }

    /// Run every step and return the refined matcher.
    pub fn fit(reco: &Jet, truth: &Jet, config: &MatchingConfig) -> FlowResult<Self> {
        let mut matcher = Self::new(reco, truth, config)?;
        matcher.run()?;
        Ok(matcher)
    }

    /// Run every remaining step.
    pub fn run(&mut self) -> FlowResult<()> {
        if self.state < MatcherState::UncertaintiesFilled {
            self.fill_uncertainties()?;
        }
        if self.state < MatcherState::PrefitDone {
            self.do_prefit()?;
        }
        if self.state < MatcherState::LossBuilt {
            self.build_loss()?;
        }
        if self.state < MatcherState::OptimizerInitialized {
            self.initialize_optimizer()?;
        }
        if self.state < MatcherState::Minimized {
            self.minimize()?;
        }
        Ok(())
    }

    /// Use a different optimizer. `prototype` must not have any parameters yet; it is cloned
    /// each time [`Matcher::initialize_optimizer`] runs.
    pub fn with_optimizer(self, prototype: Box<dyn Optimizer>) -> Self {
        Self { prototype, ..self }
    }

    /// Use a different propagator for lost-track recovery.
    pub fn with_propagator(self, propagator: Box<dyn TrackPropagator>) -> Self {
        Self {
            recovery: self.recovery.with_propagator(propagator),
            ..self
        }
    }

    fn enter(&self, target: MatcherState) -> FlowResult<()> {
        if self.state == target || self.state.next() == Some(target) {
            Ok(())
        } else {
            Err(FlowError::InvalidTransition {
                from: self.state.to_string(),
                to: target.to_string(),
            })
        }
    }

    fn not_ready(&self, operation: &str) -> FlowError {
        FlowError::NotReady {
            operation: operation.to_string(),
            state: self.state.to_string(),
        }
    }

    /// Assign resolutions to every reconstructed particle.
    pub fn fill_uncertainties(&mut self) -> FlowResult<()> {
        self.enter(MatcherState::UncertaintiesFilled)?;
        self.uncertainty.add_uncertainties(&mut self.reco)?;
        self.state = MatcherState::UncertaintiesFilled;
        Ok(())
    }

    /// Collect candidates, recover lost particles, resolve conflicts, and split the result into
    /// fixed entries and floating fit locations.
    pub fn do_prefit(&mut self) -> FlowResult<()> {
        self.enter(MatcherState::PrefitDone)?;
        let mut candidates = MatchMap::new();
        for (i, part) in self.reco.particles.iter().enumerate() {
            let list = self.prefitter.prefit(part, &self.truth, &self.filter)?;
            if !list.is_empty() {
                candidates.insert(i, list);
            }
        }
        self.recovery.recover(
            &self.reco,
            &self.truth,
            &self.filter,
            &self.prefitter,
            &mut candidates,
        )?;
        let refined = self.refiner.refine(&candidates, &self.reco, &self.truth)?;
        self.fixed = DMatrix::zeros(self.reco.n_part(), self.truth.n_part());
        self.locations.clear();
        for (&j, recos) in &refined {
            match recos.as_slice() {
                [] => {}
                [i] => self.fixed[(*i, j)] = 1.0,
                many => self.locations.extend(many.iter().map(|&i| (i, j))),
            }
        }
        self.floating = vec![true; self.locations.len()];
        debug!(
            "prefit {}x{}: {} fixed entries, {} fit locations",
            self.reco.n_part(),
            self.truth.n_part(),
            self.fixed.iter().filter(|&&a| a > 0.0).count(),
            self.locations.len()
        );
        self.state = MatcherState::PrefitDone;
        Ok(())
    }

    /// Build the chi-square over the fit locations.
    pub fn build_loss(&mut self) -> FlowResult<()> {
        self.enter(MatcherState::LossBuilt)?;
        self.loss = Some(ChisqLoss::new(
            &self.reco,
            &self.truth,
            &self.fixed,
            &self.locations,
            &self.pileup,
        )?);
        self.state = MatcherState::LossBuilt;
        Ok(())
    }

    /// Register one bounded parameter per fit location. Nothing is registered when every entry
    /// is already determined.
    pub fn initialize_optimizer(&mut self) -> FlowResult<()> {
        self.enter(MatcherState::OptimizerInitialized)?;
        self.optimizer = if self.locations.is_empty() {
            None
        } else {
            let mut optimizer = self.prototype.clone();
            for &(i, j) in &self.locations {
                optimizer.add_parameter(&format!("{i}x{j}"), 0.5, (0.0, 1.0));
            }
            Some(optimizer)
        };
        self.floating = vec![true; self.locations.len()];
        self.status = None;
        self.unrefined_chisq = None;
        self.converged = true;
        self.refinement = RefineSummary::default();
        self.state = MatcherState::OptimizerInitialized;
        Ok(())
    }

    /// Minimize the loss once, then refine the fit (see [`Matcher::refine_fit`]).
    pub fn minimize(&mut self) -> FlowResult<FitStatus> {
        if self.state != MatcherState::OptimizerInitialized {
            return Err(FlowError::InvalidTransition {
                from: self.state.to_string(),
                to: MatcherState::Minimized.to_string(),
            });
        }
        let loss = self.loss.as_ref().ok_or_else(|| self.not_ready("minimize"))?;
        let status = match self.optimizer.as_mut() {
            Some(optimizer) => optimizer.minimize(loss),
            None => FitStatus {
                fx: loss.evaluate(&[]),
                converged: true,
                n_free: 0,
            },
        };
        self.converged = status.converged;
        self.status = Some(status);
        self.unrefined_chisq = Some(status.fx);
        self.state = MatcherState::Minimized;
        self.refine_fit()?;
        self.status.ok_or_else(|| self.not_ready("minimize"))
    }

    /// Greedily drop truth particles, then reconstructed particles, then clip negligible
    /// entries.
    pub fn refine_fit(&mut self) -> FlowResult<()> {
        self.enter(MatcherState::Refined)?;
        if self.state == MatcherState::Refined {
            return Ok(());
        }
        if self.optimizer.is_some() {
            self.refinement.truth_dropped = self.greedy_drop_particles(Side::Truth)?;
            self.refinement.reco_dropped = self.greedy_drop_particles(Side::Reco)?;
            self.refinement.clipped = self.iteratively_clip()?;
        }
        self.state = MatcherState::Refined;
        Ok(())
    }

    fn particle(&self, side: Side, index: usize) -> &Particle {
        match side {
            Side::Truth => &self.truth.particles[index],
            Side::Reco => &self.reco.particles[index],
        }
    }

    /// Tentatively remove each particle of `side` from the fit in index order, keeping the
    /// removal only if the chi-square strictly decreases.
    ///
    /// A removal that leaves some other truth particle without any match is rejected, except on
    /// the reconstructed side when `allow_induced_loss` is set. Rejected removals restore the
    /// optimizer and the floating flags exactly.
    pub fn greedy_drop_particles(&mut self, side: Side) -> FlowResult<usize> {
        if self.state != MatcherState::Minimized {
            return Err(self.not_ready("greedy_drop_particles"));
        }
        let (n, filter) = match side {
            Side::Truth => (self.truth.n_part(), self.refit.drop_truth),
            Side::Reco => (self.reco.n_part(), self.refit.drop_reco),
        };
        let mut dropped = 0;
        for k in 0..n {
            let part = self.particle(side, k);
            if !filter.accepts(part.pdgid, part.charge) {
                continue;
            }
            let touching: Vec<usize> = self
                .locations
                .iter()
                .enumerate()
                .filter(|&(idx, &(i, j))| {
                    self.floating[idx]
                        && match side {
                            Side::Truth => j == k,
                            Side::Reco => i == k,
                        }
                })
                .map(|(idx, _)| idx)
                .collect();
            if touching.is_empty() {
                continue;
            }
            let (Some(loss), Some(current)) = (self.loss.as_ref(), self.status) else {
                return Err(self.not_ready("greedy_drop_particles"));
            };
            let Some(optimizer) = self.optimizer.as_mut() else {
                return Err(self.not_ready("greedy_drop_particles"));
            };
            let matched_before = matched_columns(&loss.full_matrix(optimizer.values()));
            let snapshot = optimizer.clone();
            for &idx in &touching {
                optimizer.set_value(idx, 0.0);
                optimizer.fix(idx);
            }
            let status = optimizer.minimize(loss);
            let matched_after = matched_columns(&loss.full_matrix(optimizer.values()));
            let induced = matched_before
                .iter()
                .zip(&matched_after)
                .enumerate()
                .any(|(j, (&before, &after))| {
                    before && !after && !(side == Side::Truth && j == k)
                });
            let allowed = !induced || (side == Side::Reco && self.refit.allow_induced_loss);
            if allowed && status.fx < current.fx {
                trace!(
                    "dropped {:?} particle {}: chisq {} -> {}",
                    side,
                    k,
                    current.fx,
                    status.fx
                );
                for &idx in &touching {
                    self.floating[idx] = false;
                }
                self.converged &= status.converged;
                self.status = Some(status);
                dropped += 1;
            } else {
                self.optimizer = Some(snapshot);
            }
        }
        if dropped > 0 {
            debug!("greedy drop removed {} {:?} particles", dropped, side);
        }
        Ok(dropped)
    }

    /// Repeatedly fix at zero every floating entry whose normalized value is below the clip
    /// value and re-minimize, until nothing changes or the round limit is reached.
    ///
    /// A round that raises the chi-square is reverted and ends clipping, so clipping never
    /// increases the loss.
    pub fn iteratively_clip(&mut self) -> FlowResult<usize> {
        if self.state != MatcherState::Minimized {
            return Err(self.not_ready("iteratively_clip"));
        }
        let mut clipped = 0;
        self.refinement.clip_rounds = 0;
        for round in 0..self.refit.max_refit {
            let (Some(loss), Some(current)) = (self.loss.as_ref(), self.status) else {
                return Err(self.not_ready("iteratively_clip"));
            };
            let Some(optimizer) = self.optimizer.as_mut() else {
                break;
            };
            let matrix = loss.full_matrix(optimizer.values());
            let to_clip: Vec<usize> = self
                .locations
                .iter()
                .enumerate()
                .filter(|&(idx, &(i, j))| {
                    self.floating[idx] && matrix[(i, j)] < self.refit.clip_value
                })
                .map(|(idx, _)| idx)
                .collect();
            if to_clip.is_empty() {
                break;
            }
            let snapshot = optimizer.clone();
            for &idx in &to_clip {
                optimizer.set_value(idx, 0.0);
                optimizer.fix(idx);
            }
            let status = optimizer.minimize(loss);
            if status.fx > current.fx {
                debug!(
                    "clipping round {} raised chisq {} -> {}, reverted",
                    round, current.fx, status.fx
                );
                self.optimizer = Some(snapshot);
                break;
            }
            trace!("clipping round {} fixed {} entries", round, to_clip.len());
            for &idx in &to_clip {
                self.floating[idx] = false;
            }
            clipped += to_clip.len();
            self.refinement.clip_rounds += 1;
            self.converged &= status.converged;
            self.status = Some(status);
        }
        Ok(clipped)
    }

    fn matrix_from(&self, parameters: &[Float]) -> DMatrix<Float> {
        let mut matrix = self.fixed.clone();
        for (&(i, j), &value) in self.locations.iter().zip(parameters) {
            matrix[(i, j)] = value;
        }
        normalize_columns(&mut matrix);
        matrix
    }

    /// Current optimizer parameters (empty when nothing floats).
    pub fn parameters(&self) -> Vec<Float> {
        self.optimizer
            .as_ref()
            .map(|optimizer| optimizer.values().to_vec())
            .unwrap_or_default()
    }

    /// The column-normalized transfer matrix: each column sums to one, or to zero for a truth
    /// particle without any match.
    pub fn rawmat(&self) -> DMatrix<Float> {
        self.matrix_from(&self.parameters())
    }

    /// The transfer matrix with each row rescaled so that pushing the truth pt through it
    /// reproduces the observed reconstructed pt.
    pub fn ptrans(&self) -> DMatrix<Float> {
        conserve_energy(&self.rawmat(), &self.reco.pt_vec(), &self.truth.pt_vec())
    }

    /// The loss at the current parameters.
    pub fn chisq(&self) -> FlowResult<Float> {
        self.loss
            .as_ref()
            .map(|loss| loss.evaluate(&self.parameters()))
            .ok_or_else(|| self.not_ready("chisq"))
    }

    /// Collect every output of a refined matcher.
    pub fn result(&self) -> FlowResult<MatchResult> {
        if self.state != MatcherState::Refined {
            return Err(self.not_ready("result"));
        }
        let chisq = self.chisq()?;
        Ok(MatchResult {
            ptrans: self.ptrans(),
            rawmat: self.rawmat(),
            chisq,
            unrefined_chisq: self.unrefined_chisq.unwrap_or(chisq),
            converged: self.converged,
            fit_locations: self.locations.clone(),
            floating: self.floating.clone(),
            refinement: self.refinement,
        })
    }

    /// The current state.
    pub fn state(&self) -> MatcherState {
        self.state
    }

    /// (reco, truth) entries handed to the optimizer.
    pub fn fit_locations(&self) -> &[(usize, usize)] {
        &self.locations
    }

    /// Which fit locations are still floating.
    pub fn floating(&self) -> &[bool] {
        &self.floating
    }

    /// Entries fixed at one because a single candidate survived conflict resolution.
    pub fn fixed(&self) -> &DMatrix<Float> {
        &self.fixed
    }

    /// What refinement changed (all zero before [`Matcher::refine_fit`]).
    pub fn refinement(&self) -> RefineSummary {
        self.refinement
    }

    /// Status of the last accepted minimization.
    pub fn status(&self) -> Option<FitStatus> {
        self.status
    }

    /// The matcher's copy of the reconstructed jet, with resolutions once filled.
    pub fn reco_jet(&self) -> &Jet {
        &self.reco
    }

    /// The matcher's copy of the truth jet.
    pub fn truth_jet(&self) -> &Jet {
        &self.truth
    }
}

fn matched_columns(matrix: &DMatrix<Float>) -> Vec<bool> {
    matrix.column_iter().map(|c| c.sum() > 0.0).collect()
}

/// Rescale each row of `matrix` so that `matrix * truth_pt` equals `reco_pt` wherever the
/// prediction is nonzero. Rows with zero prediction are left untouched.
pub fn conserve_energy(
    matrix: &DMatrix<Float>,
    reco_pt: &DVector<Float>,
    truth_pt: &DVector<Float>,
) -> DMatrix<Float> {
    let predicted = matrix * truth_pt;
    let mut result = matrix.clone();
    for (i, mut row) in result.row_iter_mut().enumerate() {
        if predicted[i] > 0.0 {
            row *= reco_pt[i] / predicted[i];
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        filter::AngularConfig,
        loss::PileupPenalty,
        uncertainty::{UncertaintyConfig, UncertaintyMode},
        utils::enums::PerFlavor,
    };
    use approx::assert_relative_eq;

    fn config() -> MatchingConfig {
        env_logger::try_init().ok();
        let mut config = MatchingConfig {
            uncertainty: UncertaintyConfig {
                mode: UncertaintyMode::Naive,
                ..Default::default()
            },
            pileup: PerFlavor::splat(PileupPenalty {
                pt0: 1.0,
                exponent: 2.0,
                penalty: 1.0,
            }),
            ..Default::default()
        };
        config.filter.photon.angular = AngularConfig::cone(0.05, 5.2);
        config
    }

    /// Holds every parameter where it is, so refinement decisions depend only on the loss.
    #[derive(Clone, Default)]
    struct FrozenOptimizer {
        names: Vec<String>,
        values: Vec<Float>,
        fixed: Vec<bool>,
    }

    impl Optimizer for FrozenOptimizer {
        fn add_parameter(&mut self, name: &str, initial: Float, _bounds: (Float, Float)) -> usize {
            self.names.push(name.to_string());
            self.values.push(initial);
            self.fixed.push(false);
            self.values.len() - 1
        }
        fn names(&self) -> &[String] {
            &self.names
        }
        fn values(&self) -> &[Float] {
            &self.values
        }
        fn set_value(&mut self, index: usize, value: Float) {
            self.values[index] = value;
        }
        fn fix(&mut self, index: usize) {
            self.fixed[index] = true;
        }
        fn release(&mut self, index: usize) {
            self.fixed[index] = false;
        }
        fn is_fixed(&self, index: usize) -> bool {
            self.fixed[index]
        }
        fn minimize(&mut self, objective: &dyn Objective) -> FitStatus {
            FitStatus {
                fx: objective.evaluate(&self.values),
                converged: true,
                n_free: self.n_free(),
            }
        }
    }

    fn frozen_fit(reco: &Jet, truth: &Jet, config: &MatchingConfig) -> MatchResult {
        let mut matcher = Matcher::new(reco, truth, config)
            .unwrap()
            .with_optimizer(Box::new(FrozenOptimizer::default()));
        matcher.run().unwrap();
        matcher.result().unwrap()
    }

    fn pileup(pt: Float) -> Float {
        4.0 * pt.ln() + 1.0
    }

    fn photon(pt: Float, eta: Float, phi: Float) -> Particle {
        Particle::new(pt, eta, phi, 22, 0)
    }

    fn assert_column_stochastic(matrix: &DMatrix<Float>) {
        for column in matrix.column_iter() {
            let sum = column.sum();
            assert!(sum == 0.0 || (sum - 1.0).abs() < 1e-12, "column sum {}", sum);
        }
    }

    #[test]
    fn test_single_pair() {
        let reco = Jet::new(vec![photon(10.0, 0.0, 0.0)]);
        let truth = Jet::new(vec![photon(10.5, 0.01, 0.02)]);
        let matcher = Matcher::fit(&reco, &truth, &config()).unwrap();
        assert!(matcher.fit_locations().is_empty());
        assert!(matcher.parameters().is_empty());
        assert_relative_eq!(matcher.rawmat()[(0, 0)], 1.0);
        assert_relative_eq!(matcher.chisq().unwrap(), 0.25 + 0.04 + 0.16, epsilon = 1e-9);
        assert_relative_eq!(matcher.ptrans()[(0, 0)], 10.0 / 10.5, epsilon = 1e-12);
        let result = matcher.result().unwrap();
        assert!(result.converged);
        assert_eq!(result.n_floating(), 0);
        assert_relative_eq!(result.chisq, result.unrefined_chisq);
    }

    #[test]
    fn test_conflict_goes_to_closest() {
        let reco = Jet::new(vec![photon(10.0, 0.0, 0.01), photon(10.0, 0.0, 0.03)]);
        let truth = Jet::new(vec![photon(20.0, 0.0, 0.0)]);
        let config = MatchingConfig {
            refiner: RefinerStrategy::OneGenOneReco,
            ..config()
        };
        let matcher = Matcher::fit(&reco, &truth, &config).unwrap();
        assert!(matcher.fit_locations().is_empty());
        let rawmat = matcher.rawmat();
        assert_relative_eq!(rawmat[(0, 0)], 1.0);
        assert_relative_eq!(rawmat[(1, 0)], 0.0);
        assert_relative_eq!(matcher.fixed()[(0, 0)], 1.0);
    }

    #[test]
    fn test_unmatched_reco_pays_pileup() {
        let reco = Jet::new(vec![
            photon(10.0, 0.0, 0.0),
            Particle::new(5.0, 1.0, 1.0, 130, 0),
        ]);
        let truth = Jet::new(vec![photon(10.0, 0.0, 0.0)]);
        let matcher = Matcher::fit(&reco, &truth, &config()).unwrap();
        let rawmat = matcher.rawmat();
        assert_relative_eq!(rawmat.row(1).sum(), 0.0);
        assert_relative_eq!(
            matcher.chisq().unwrap(),
            4.0 * (5.0 as Float).ln() + 1.0,
            epsilon = 1e-9
        );
        let ptrans = matcher.ptrans();
        assert_relative_eq!(ptrans.row(1).sum(), 0.0);
    }

    #[test]
    fn test_zero_clip_never_clips() {
        let reco = Jet::new(vec![photon(5.0, 0.0, 0.005), photon(15.0, 0.0, -0.005)]);
        let truth = Jet::new(vec![photon(20.0, 0.0, 0.0)]);
        let mut config = config();
        config.refit.clip_value = 0.0;
        config.refit.drop_truth = ParticleFilter::None;
        config.refit.drop_reco = ParticleFilter::None;
        let matcher = Matcher::fit(&reco, &truth, &config).unwrap();
        let status = matcher.status().unwrap();
        assert_eq!(status.n_free, 2);
        assert_relative_eq!(status.fx, 0.02, epsilon = 1e-4);
        assert_eq!(matcher.fit_locations(), &[(0, 0), (1, 0)]);
        assert!(matcher.floating().iter().all(|&f| f));
        assert_eq!(matcher.refinement(), RefineSummary::default());
        let rawmat = matcher.rawmat();
        assert_column_stochastic(&rawmat);
        assert_relative_eq!(rawmat[(0, 0)], 0.25, epsilon = 1e-3);
        assert_relative_eq!(rawmat[(1, 0)], 0.75, epsilon = 1e-3);
    }

    #[test]
    fn test_spurious_reco_is_dropped() {
        let reco = Jet::new(vec![photon(10.0, 0.0, 0.0), photon(1.0, 0.0, 0.04)]);
        let truth = Jet::new(vec![photon(10.0, 0.0, 0.0)]);
        let mut matcher = Matcher::new(&reco, &truth, &config()).unwrap();
        matcher.run().unwrap();
        let result = matcher.result().unwrap();
        assert_relative_eq!(result.unrefined_chisq, 1.6301, epsilon = 1e-3);
        assert_eq!(matcher.fit_locations(), &[(0, 0), (1, 0)]);
        assert_eq!(matcher.floating(), &[true, false]);
        assert_eq!(result.refinement.truth_dropped, 0);
        assert_eq!(result.refinement.reco_dropped, 1);
        let rawmat = matcher.rawmat();
        assert_relative_eq!(rawmat[(0, 0)], 1.0, epsilon = 1e-12);
        assert_relative_eq!(rawmat[(1, 0)], 0.0);
        assert_relative_eq!(result.chisq, 1.0, epsilon = 1e-6);
        assert!(result.chisq <= result.unrefined_chisq);
    }

    #[test]
    fn test_refinement_properties() {
        let reco = Jet::new(vec![
            photon(12.0, 0.0, 0.0),
            photon(3.0, 0.01, 0.02),
            photon(7.5, 0.3, 0.3),
            Particle::new(6.0, 0.31, 0.29, 130, 0),
            Particle::new(2.0, -1.0, 2.0, 22, 0),
        ]);
        let truth = Jet::new(vec![
            photon(10.0, 0.005, 0.005),
            photon(4.0, 0.01, 0.01),
            photon(8.0, 0.3, 0.3),
            Particle::new(5.0, 0.3, 0.3, 130, 0),
        ]);
        let matcher = Matcher::fit(&reco, &truth, &config()).unwrap();
        let result = matcher.result().unwrap();
        assert_column_stochastic(&result.rawmat);
        assert!(result.chisq <= result.unrefined_chisq);
        for i in 0..reco.n_part() {
            for j in 0..truth.n_part() {
                if matcher.fixed()[(i, j)] == 1.0 {
                    assert!(!result.fit_locations.contains(&(i, j)));
                    assert_relative_eq!(result.rawmat[(i, j)], 1.0, epsilon = 1e-12);
                }
            }
        }
        let ptrans = result.ptrans;
        assert_relative_eq!(
            conserve_energy(&ptrans, &reco.pt_vec(), &truth.pt_vec()),
            ptrans,
            epsilon = 1e-12
        );
        let predicted = &ptrans * truth.pt_vec();
        for i in 0..reco.n_part() {
            if predicted[i] > 0.0 {
                assert_relative_eq!(predicted[i], reco.particles[i].pt, epsilon = 1e-9);
            }
        }
    }

    fn spurious_truth() -> (Jet, Jet) {
        let reco = Jet::new(vec![photon(10.0, 0.0, 0.0), photon(10.0, 0.0, 0.08)]);
        let truth = Jet::new(vec![
            photon(10.0, 0.0, 0.0),
            photon(10.0, 0.0, 0.08),
            photon(5.0, 0.0, 0.04),
        ]);
        (reco, truth)
    }

    #[test]
    fn test_spurious_truth_is_dropped() {
        let (reco, truth) = spurious_truth();
        let result = frozen_fit(&reco, &truth, &config());
        assert_eq!(result.fit_locations, vec![(0, 2), (1, 2)]);
        assert_relative_eq!(result.unrefined_chisq, 12.5 + 2.0 * 0.0256, epsilon = 1e-9);
        assert_eq!(result.floating, vec![false, false]);
        assert_eq!(
            result.refinement,
            RefineSummary {
                truth_dropped: 1,
                ..Default::default()
            }
        );
        assert_relative_eq!(result.chisq, 0.0, epsilon = 1e-12);
        assert_relative_eq!(result.rawmat.column(2).sum(), 0.0);
        assert_relative_eq!(result.rawmat[(0, 0)], 1.0);
        assert_relative_eq!(result.rawmat[(1, 1)], 1.0);
    }

    #[test]
    fn test_truth_drop_respects_filter() {
        let (reco, truth) = spurious_truth();
        let mut config = config();
        config.refit.drop_truth = ParticleFilter::Charged;
        let result = frozen_fit(&reco, &truth, &config);
        assert_eq!(result.floating, vec![true, true]);
        assert_eq!(result.refinement, RefineSummary::default());
        assert_relative_eq!(result.chisq, result.unrefined_chisq);
        assert_relative_eq!(result.rawmat[(0, 2)], 0.5);
        assert_relative_eq!(result.rawmat[(1, 2)], 0.5);
    }

    fn shared_truth() -> (Jet, Jet, MatchingConfig) {
        let reco = Jet::new(vec![photon(1.0, 0.0, 0.04), photon(3.0, 0.0, 0.0)]);
        let truth = Jet::new(vec![photon(10.0, 0.0, 0.0)]);
        let mut config = config();
        config.refit.drop_truth = ParticleFilter::None;
        (reco, truth, config)
    }

    #[test]
    fn test_reco_drop_cannot_orphan_truth() {
        let (reco, truth, config) = shared_truth();
        let result = frozen_fit(&reco, &truth, &config);
        assert_relative_eq!(
            result.unrefined_chisq,
            1600.0 + (2.0 / 0.3 as Float).powi(2) + 0.64,
            epsilon = 1e-9
        );
        assert_eq!(result.floating, vec![false, true]);
        assert_eq!(result.refinement.reco_dropped, 1);
        assert_relative_eq!(
            result.chisq,
            (7.0 / 0.3 as Float).powi(2) + pileup(1.0),
            epsilon = 1e-9
        );
        assert_relative_eq!(result.rawmat[(1, 0)], 1.0);
    }

    #[test]
    fn test_reco_drop_with_induced_loss() {
        let (reco, truth, mut config) = shared_truth();
        config.refit.allow_induced_loss = true;
        let result = frozen_fit(&reco, &truth, &config);
        assert_eq!(result.floating, vec![false, false]);
        assert_eq!(result.refinement.reco_dropped, 2);
        assert_relative_eq!(result.chisq, pileup(1.0) + pileup(3.0), epsilon = 1e-9);
        assert_relative_eq!(result.rawmat.column(0).sum(), 0.0);
        assert_relative_eq!(result.ptrans.sum(), 0.0);
    }

    fn clip_config(clip_value: Float, max_refit: usize, penalty: Float) -> MatchingConfig {
        let mut config = config();
        config.refit.clip_value = clip_value;
        config.refit.max_refit = max_refit;
        config.refit.drop_truth = ParticleFilter::None;
        config.refit.drop_reco = ParticleFilter::None;
        config.pileup = PerFlavor::splat(PileupPenalty {
            pt0: 1.0,
            exponent: 2.0,
            penalty,
        });
        config
    }

    #[test]
    fn test_clip_round_that_raises_chisq_is_reverted() {
        let reco = Jet::new(vec![photon(5.0, 0.0, 0.005), photon(15.0, 0.0, -0.005)]);
        let truth = Jet::new(vec![photon(20.0, 0.0, 0.0)]);
        let result = frozen_fit(&reco, &truth, &clip_config(0.6, 10, 1000.0));
        assert_relative_eq!(result.unrefined_chisq, 100.0 + 100.0 / 9.0 + 0.02, epsilon = 1e-9);
        assert_eq!(result.floating, vec![true, true]);
        assert_eq!(result.refinement, RefineSummary::default());
        assert_relative_eq!(result.chisq, result.unrefined_chisq);
        assert_relative_eq!(result.rawmat[(0, 0)], 0.5);
    }

    #[test]
    fn test_max_refit_caps_clipping() {
        let reco = Jet::new(vec![photon(5.0, 0.0, 0.005), photon(15.0, 0.0, -0.005)]);
        let truth = Jet::new(vec![photon(20.0, 0.0, 0.0)]);
        let capped = frozen_fit(&reco, &truth, &clip_config(0.6, 0, 1.0));
        assert_eq!(capped.floating, vec![true, true]);
        assert_eq!(capped.refinement.clip_rounds, 0);
        let clipped = frozen_fit(&reco, &truth, &clip_config(0.6, 1, 1.0));
        assert_eq!(clipped.floating, vec![false, false]);
        assert_eq!(
            clipped.refinement,
            RefineSummary {
                clipped: 2,
                clip_rounds: 1,
                ..Default::default()
            }
        );
        assert_relative_eq!(clipped.chisq, pileup(5.0) + pileup(15.0), epsilon = 1e-9);
        assert!(clipped.chisq < clipped.unrefined_chisq);
    }

    #[test]
    fn test_caller_jets_are_untouched() {
        let reco = Jet::new(vec![photon(10.0, 0.0, 0.0)]);
        let truth = Jet::new(vec![photon(10.0, 0.0, 0.0)]);
        let matcher = Matcher::fit(&reco, &truth, &config()).unwrap();
        assert_relative_eq!(reco.particles[0].dpt, 0.0);
        assert_relative_eq!(matcher.reco_jet().particles[0].dpt, 1.0);
    }

    #[test]
    fn test_state_machine() {
        let reco = Jet::new(vec![photon(5.0, 0.0, 0.005), photon(15.0, 0.0, -0.005)]);
        let truth = Jet::new(vec![photon(20.0, 0.0, 0.0)]);
        let mut matcher = Matcher::new(&reco, &truth, &config()).unwrap();
        assert_eq!(matcher.state(), MatcherState::Constructed);
        assert!(matches!(
            matcher.do_prefit(),
            Err(FlowError::InvalidTransition { .. })
        ));
        assert!(matches!(matcher.chisq(), Err(FlowError::NotReady { .. })));
        matcher.fill_uncertainties().unwrap();
        matcher.fill_uncertainties().unwrap();
        assert_relative_eq!(matcher.reco_jet().particles[1].dpt, 1.5);
        matcher.do_prefit().unwrap();
        let locations = matcher.fit_locations().to_vec();
        matcher.do_prefit().unwrap();
        assert_eq!(matcher.fit_locations(), locations.as_slice());
        assert!(matches!(
            matcher.minimize(),
            Err(FlowError::InvalidTransition { .. })
        ));
        matcher.build_loss().unwrap();
        matcher.initialize_optimizer().unwrap();
        assert_eq!(matcher.parameters(), vec![0.5, 0.5]);
        assert!(matches!(
            matcher.fill_uncertainties(),
            Err(FlowError::InvalidTransition { .. })
        ));
        matcher.minimize().unwrap();
        assert_eq!(matcher.state(), MatcherState::Refined);
        assert!(matcher.minimize().is_err());
        assert!(matcher.refine_fit().is_ok());
    }

    #[test]
    fn test_unknown_reco_flavor() {
        let reco = Jet::new(vec![Particle::new(10.0, 0.0, 0.0, 15, -1)]);
        let truth = Jet::new(vec![photon(10.0, 0.0, 0.0)]);
        assert!(matches!(
            Matcher::fit(&reco, &truth, &config()),
            Err(FlowError::UnknownFlavor { .. })
        ));
    }

    #[test]
    fn test_empty_jets() {
        let matcher = Matcher::fit(&Jet::default(), &Jet::default(), &config()).unwrap();
        assert_eq!(matcher.rawmat().shape(), (0, 0));
        assert_relative_eq!(matcher.chisq().unwrap(), 0.0);
    }
}
