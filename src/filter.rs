use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    data::Particle,
    utils::{
        check_table_size, chisquared, delta_r2,
        enums::{Flavor, PerFlavor},
        EtaRegions,
    },
    FlowError, FlowResult, Float,
};

/// Which truth particles a reconstructed particle may be matched to, by truth type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlavorFilter {
    /// Every truth particle.
    Any,
    /// No truth particle.
    None,
    /// Truth particles with nonzero charge.
    AnyCharged,
    /// Truth particles with zero charge.
    AnyNeutral,
    /// Truth hadrons of either charge.
    AnyHadron,
    /// Charged truth hadrons.
    AnyChargedHadron,
    /// Neutral truth hadrons.
    AnyNeutralHadron,
    /// Truth electrons or muons.
    AnyLepton,
    /// Truth electrons.
    Electron,
    /// Truth muons.
    Muon,
    /// Truth electrons or muons (alias of [`FlavorFilter::AnyLepton`] kept for configuration
    /// compatibility).
    ElectronMuon,
    /// Truth photons.
    Photon,
    /// Truth photons, electrons, and neutral pions.
    Electromagnetic,
    /// Truth photons, or truth neutral hadrons above the check's hadron pt threshold.
    PhotonOrHardNeutralHadron,
}

impl FlavorFilter {
    /// Whether `truth` is acceptable. `hadron_pt` is only used by
    /// [`FlavorFilter::PhotonOrHardNeutralHadron`].
    pub fn accepts(&self, truth: &Particle, hadron_pt: Float) -> bool {
        let hadron = truth.pdgid >= 100;
        let charged = truth.charge != 0;
        match self {
            Self::Any => true,
            Self::None => false,
            Self::AnyCharged => charged,
            Self::AnyNeutral => !charged,
            Self::AnyHadron => hadron,
            Self::AnyChargedHadron => hadron && charged,
            Self::AnyNeutralHadron => hadron && !charged,
            Self::AnyLepton | Self::ElectronMuon => truth.pdgid == 11 || truth.pdgid == 13,
            Self::Electron => truth.pdgid == 11,
            Self::Muon => truth.pdgid == 13,
            Self::Photon => truth.pdgid == 22,
            Self::Electromagnetic => matches!(truth.pdgid, 11 | 22 | 111),
            Self::PhotonOrHardNeutralHadron => {
                truth.pdgid == 22 || (hadron && !charged && truth.pt > hadron_pt)
            }
        }
    }
}

impl Display for FlavorFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlavorFilter::Any => write!(f, "Any"),
            FlavorFilter::None => write!(f, "None"),
            FlavorFilter::AnyCharged => write!(f, "Any Charged"),
            FlavorFilter::AnyNeutral => write!(f, "Any Neutral"),
            FlavorFilter::AnyHadron => write!(f, "Any Hadron"),
            FlavorFilter::AnyChargedHadron => write!(f, "Any Charged Hadron"),
            FlavorFilter::AnyNeutralHadron => write!(f, "Any Neutral Hadron"),
            FlavorFilter::AnyLepton => write!(f, "Any Lepton"),
            FlavorFilter::Electron => write!(f, "Electron"),
            FlavorFilter::Muon => write!(f, "Muon"),
            FlavorFilter::ElectronMuon => write!(f, "Electron/Muon"),
            FlavorFilter::Photon => write!(f, "Photon"),
            FlavorFilter::Electromagnetic => write!(f, "Electromagnetic"),
            FlavorFilter::PhotonOrHardNeutralHadron => write!(f, "Photon or Hard Neutral Hadron"),
        }
    }
}

impl FromStr for FlavorFilter {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace([' ', '-', '_'], "").as_str() {
            "any" | "all" => Ok(Self::Any),
            "none" => Ok(Self::None),
            "anycharged" | "charged" => Ok(Self::AnyCharged),
            "anyneutral" | "neutral" => Ok(Self::AnyNeutral),
            "anyhadron" | "hadron" => Ok(Self::AnyHadron),
            "anychargedhadron" | "chargedhadron" | "hadch" => Ok(Self::AnyChargedHadron),
            "anyneutralhadron" | "neutralhadron" | "had0" => Ok(Self::AnyNeutralHadron),
            "anylepton" | "lepton" => Ok(Self::AnyLepton),
            "electron" | "ele" => Ok(Self::Electron),
            "muon" | "mu" => Ok(Self::Muon),
            "electronmuon" | "elemu" => Ok(Self::ElectronMuon),
            "photon" | "em0" => Ok(Self::Photon),
            "electromagnetic" | "em" => Ok(Self::Electromagnetic),
            "photonorhardneutralhadron" | "em0orhardhad0" => Ok(Self::PhotonOrHardNeutralHadron),
            _ => Err(FlowError::ParseError {
                name: s.to_string(),
                object: "FlavorFilter".to_string(),
            }),
        }
    }
}

/// Flavor compatibility with a soft and a hard variant, switched on the reconstructed pt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlavorCheck {
    /// Filter used when the reconstructed pt is below `hard_threshold`.
    pub soft: FlavorFilter,
    /// Filter used otherwise.
    pub hard: FlavorFilter,
    /// Reconstructed pt separating the soft and hard regimes.
    pub hard_threshold: Float,
    /// Truth pt above which a neutral hadron counts as hard.
    pub hadron_pt: Float,
}

impl FlavorCheck {
    /// The same filter in both regimes.
    pub fn uniform(filter: FlavorFilter) -> Self {
        Self {
            soft: filter,
            hard: filter,
            hard_threshold: 0.0,
            hadron_pt: 0.0,
        }
    }

    /// Whether `truth` is flavor-compatible with `reco`.
    pub fn pass(&self, reco: &Particle, truth: &Particle) -> bool {
        let filter = if reco.pt < self.hard_threshold {
            self.soft
        } else {
            self.hard
        };
        filter.accepts(truth, self.hadron_pt)
    }
}

/// Charge compatibility between a reconstructed and a truth particle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargeFilter {
    /// Identical charges.
    Exact,
    /// Same sign (two neutrals are compatible).
    Sign,
    /// Same absolute charge.
    Magnitude,
    /// Opposite sign (two neutrals are compatible).
    Opposite,
    /// No constraint.
    Any,
}

impl ChargeFilter {
    /// Whether the two charges are compatible.
    pub fn pass(&self, reco: &Particle, truth: &Particle) -> bool {
        match self {
            Self::Exact => reco.charge == truth.charge,
            Self::Sign => reco.charge.signum() == truth.charge.signum(),
            Self::Magnitude => reco.charge.abs() == truth.charge.abs(),
            Self::Opposite => reco.charge.signum() == -truth.charge.signum(),
            Self::Any => true,
        }
    }
}

impl Display for ChargeFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChargeFilter::Exact => write!(f, "Exact"),
            ChargeFilter::Sign => write!(f, "Sign"),
            ChargeFilter::Magnitude => write!(f, "Magnitude"),
            ChargeFilter::Opposite => write!(f, "Opposite"),
            ChargeFilter::Any => write!(f, "Any"),
        }
    }
}

impl FromStr for ChargeFilter {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exact" | "charge" | "same" => Ok(Self::Exact),
            "sign" | "same sign" => Ok(Self::Sign),
            "magnitude" | "abs" => Ok(Self::Magnitude),
            "opposite" | "opposite sign" => Ok(Self::Opposite),
            "any" | "none" => Ok(Self::Any),
            _ => Err(FlowError::ParseError {
                name: s.to_string(),
                object: "ChargeFilter".to_string(),
            }),
        }
    }
}

/// How the angular threshold of an [`AngularLimit`] is computed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AngularMode {
    /// $`\Delta R^2 < p_1^2`$.
    Const,
    /// $`(\Delta\eta/\sigma_\eta)^2 + (\Delta\phi/\sigma_\phi)^2 < p_1^2`$ with the resolution of
    /// the reconstructed particle.
    Uncertainty,
    /// $`\Delta R^2 < \min(p_1^2 + (p_2/p_T^{\rm truth})^2, p_3^2)`$.
    Tracking,
}

impl Display for AngularMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AngularMode::Const => write!(f, "Const"),
            AngularMode::Uncertainty => write!(f, "Uncertainty"),
            AngularMode::Tracking => write!(f, "Tracking"),
        }
    }
}

impl FromStr for AngularMode {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "const" | "constant" | "fixed" => Ok(Self::Const),
            "uncertainty" | "resolution" => Ok(Self::Uncertainty),
            "tracking" | "trackpt" | "track" => Ok(Self::Tracking),
            _ => Err(FlowError::ParseError {
                name: s.to_string(),
                object: "AngularMode".to_string(),
            }),
        }
    }
}

/// Angular limit parameters, binned in reconstructed $`|\eta|`$.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AngularConfig {
    /// Threshold formula.
    pub mode: AngularMode,
    /// Region edges.
    pub edges: Vec<Float>,
    /// Primary threshold (used by every mode).
    pub p1: Vec<Float>,
    /// Inverse-pt coefficient ([`AngularMode::Tracking`] only).
    #[serde(default)]
    pub p2: Vec<Float>,
    /// Cap ([`AngularMode::Tracking`] only).
    #[serde(default)]
    pub p3: Vec<Float>,
}

impl AngularConfig {
    /// A constant $`\Delta R`$ cone everywhere inside `|eta| < eta_max`.
    pub fn cone(dr: Float, eta_max: Float) -> Self {
        Self {
            mode: AngularMode::Const,
            edges: vec![0.0, eta_max],
            p1: vec![dr],
            p2: vec![],
            p3: vec![],
        }
    }
}

/// A validated angular limit.
#[derive(Clone, Debug)]
pub struct AngularLimit {
    config: AngularConfig,
    regions: EtaRegions,
}

impl AngularLimit {
    /// Validate `config`.
    pub fn new(config: &AngularConfig) -> FlowResult<Self> {
        let regions = EtaRegions::new(config.edges.clone())?;
        check_table_size("angular.p1", &regions, &config.p1)?;
        if config.mode == AngularMode::Tracking {
            check_table_size("angular.p2", &regions, &config.p2)?;
            check_table_size("angular.p3", &regions, &config.p3)?;
        }
        Ok(Self {
            config: config.clone(),
            regions,
        })
    }

    /// Whether `truth` is close enough to `reco`.
    pub fn pass(&self, reco: &Particle, truth: &Particle) -> FlowResult<bool> {
        let region = self.regions.region(reco.eta, "angular")?;
        let p1 = self.config.p1[region];
        Ok(match self.config.mode {
            AngularMode::Const => delta_r2(reco, truth) < p1 * p1,
            AngularMode::Uncertainty => chisquared(reco, truth, false) < p1 * p1,
            AngularMode::Tracking => {
                let inverse = self.config.p2[region] / truth.pt;
                let cap = self.config.p3[region];
                delta_r2(reco, truth) < (p1 * p1 + inverse * inverse).min(cap * cap)
            }
        })
    }
}

/// Minimum reconstructed pt, binned in truth $`|\eta|`$.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MinPtConfig {
    /// Region edges.
    pub edges: Vec<Float>,
    /// Floor per region.
    pub floor: Vec<Float>,
}

impl Default for MinPtConfig {
    fn default() -> Self {
        Self {
            edges: vec![0.0, 1.479, 3.0, 10.0],
            floor: vec![0.0, 0.0, 0.0],
        }
    }
}

/// A validated minimum-pt requirement.
#[derive(Clone, Debug)]
pub struct MinPt {
    regions: EtaRegions,
    floor: Vec<Float>,
}

impl MinPt {
    /// Validate `config`.
    pub fn new(config: &MinPtConfig) -> FlowResult<Self> {
        let regions = EtaRegions::new(config.edges.clone())?;
        check_table_size("min_pt.floor", &regions, &config.floor)?;
        Ok(Self {
            regions,
            floor: config.floor.clone(),
        })
    }

    /// Whether `reco` is hard enough to be matched to `truth`.
    pub fn pass(&self, reco: &Particle, truth: &Particle) -> FlowResult<bool> {
        Ok(reco.pt > self.floor[self.regions.region(truth.eta, "min_pt")?])
    }
}

/// The four checks applied to reconstructed particles of one flavor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchingFilterConfig {
    /// Flavor compatibility.
    pub flavor: FlavorCheck,
    /// Charge compatibility.
    pub charge: ChargeFilter,
    /// Angular limit.
    pub angular: AngularConfig,
    /// Minimum pt.
    pub min_pt: MinPtConfig,
}

/// A validated [`MatchingFilterConfig`].
#[derive(Clone, Debug)]
pub struct MatchingFilter {
    flavor: FlavorCheck,
    charge: ChargeFilter,
    angular: AngularLimit,
    min_pt: MinPt,
}

impl MatchingFilter {
    /// Validate `config`.
    pub fn new(config: &MatchingFilterConfig) -> FlowResult<Self> {
        Ok(Self {
            flavor: config.flavor.clone(),
            charge: config.charge,
            angular: AngularLimit::new(&config.angular)?,
            min_pt: MinPt::new(&config.min_pt)?,
        })
    }

    /// Whether the pair passes all four checks.
    pub fn pass(&self, reco: &Particle, truth: &Particle) -> FlowResult<bool> {
        Ok(self.flavor.pass(reco, truth)
            && self.charge.pass(reco, truth)
            && self.angular.pass(reco, truth)?
            && self.min_pt.pass(reco, truth)?)
    }
}

/// Per-flavor filter configuration.
pub type FilterConfig = PerFlavor<MatchingFilterConfig>;

impl Default for FilterConfig {
    fn default() -> Self {
        let tracking = AngularConfig {
            mode: AngularMode::Tracking,
            edges: vec![0.0, 0.9, 1.5, 2.5, 5.2],
            p1: vec![0.002, 0.003, 0.004, 0.01],
            p2: vec![0.02, 0.03, 0.04, 0.1],
            p3: vec![0.05, 0.05, 0.08, 0.1],
        };
        Self {
            photon: MatchingFilterConfig {
                flavor: FlavorCheck {
                    soft: FlavorFilter::Electromagnetic,
                    hard: FlavorFilter::PhotonOrHardNeutralHadron,
                    hard_threshold: 10.0,
                    hadron_pt: 5.0,
                },
                charge: ChargeFilter::Any,
                angular: AngularConfig {
                    mode: AngularMode::Const,
                    edges: vec![0.0, 1.479, 3.0, 5.2],
                    p1: vec![0.05, 0.07, 0.2],
                    p2: vec![],
                    p3: vec![],
                },
                min_pt: MinPtConfig::default(),
            },
            neutral_hadron: MatchingFilterConfig {
                flavor: FlavorCheck {
                    soft: FlavorFilter::AnyNeutral,
                    hard: FlavorFilter::AnyHadron,
                    hard_threshold: 10.0,
                    hadron_pt: 0.0,
                },
                charge: ChargeFilter::Any,
                angular: AngularConfig {
                    mode: AngularMode::Const,
                    edges: vec![0.0, 1.3, 3.0, 5.2],
                    p1: vec![0.15, 0.15, 0.3],
                    p2: vec![],
                    p3: vec![],
                },
                min_pt: MinPtConfig::default(),
            },
            charged_hadron: MatchingFilterConfig {
                flavor: FlavorCheck::uniform(FlavorFilter::AnyChargedHadron),
                charge: ChargeFilter::Sign,
                angular: tracking.clone(),
                min_pt: MinPtConfig::default(),
            },
            electron: MatchingFilterConfig {
                flavor: FlavorCheck::uniform(FlavorFilter::Electron),
                charge: ChargeFilter::Sign,
                angular: tracking.clone(),
                min_pt: MinPtConfig::default(),
            },
            muon: MatchingFilterConfig {
                flavor: FlavorCheck::uniform(FlavorFilter::Muon),
                charge: ChargeFilter::Sign,
                angular: tracking,
                min_pt: MinPtConfig::default(),
            },
        }
    }
}

/// The candidate-admissibility ensemble: one [`MatchingFilter`] per reconstructed flavor.
#[derive(Clone, Debug)]
pub struct CandidateFilter {
    filters: PerFlavor<MatchingFilter>,
}

impl CandidateFilter {
    /// Validate every member of `config`.
    pub fn new(config: &FilterConfig) -> FlowResult<Self> {
        Ok(Self {
            filters: config.try_map(MatchingFilter::new)?,
        })
    }

    /// Build the ensemble from members listed in [`Flavor::ALL`] order.
    pub fn from_members(members: Vec<MatchingFilterConfig>) -> FlowResult<Self> {
        Self::new(&PerFlavor::try_from(members)?)
    }

    /// Whether `truth` is an admissible candidate for `reco`, dispatching on the flavor of
    /// `reco`.
    pub fn pass(&self, reco: &Particle, truth: &Particle) -> FlowResult<bool> {
        self.pass_as(reco.flavor()?, reco, truth)
    }

    /// Like [`CandidateFilter::pass`] with the reconstructed flavor already known.
    pub fn pass_as(&self, flavor: Flavor, reco: &Particle, truth: &Particle) -> FlowResult<bool> {
        self.filters.get(flavor).pass(reco, truth)
    }
}
