use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    data::{Jet, Particle},
    utils::{check_table_size, enums::Flavor, EtaRegions},
    FlowError, FlowResult, Float,
};

/// Absolute resolutions assigned to a particle.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Resolution {
    /// Resolution on transverse momentum.
    pub dpt: Float,
    /// Resolution on pseudorapidity.
    pub deta: Float,
    /// Resolution on azimuthal angle.
    pub dphi: Float,
}

impl Resolution {
    fn isotropic(dpt: Float, angular: Float) -> Self {
        Self {
            dpt,
            deta: angular,
            dphi: angular,
        }
    }
}

/// Selects the resolution model.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UncertaintyMode {
    /// Flat 10% momentum resolution and 0.05 angular resolution for every particle.
    Naive,
    /// Calorimeter resolution for neutrals. Electrons and charged hadrons take the better of the
    /// tracker and calorimeter momentum resolution with tracker angles; muons use the tracker.
    Standard,
    /// Like [`UncertaintyMode::Standard`], but every non-muon charged particle is treated as a
    /// calorimeter deposit.
    SmearedTracks,
}

impl Display for UncertaintyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UncertaintyMode::Naive => write!(f, "Naive"),
            UncertaintyMode::Standard => write!(f, "Standard"),
            UncertaintyMode::SmearedTracks => write!(f, "Smeared Tracks"),
        }
    }
}

impl FromStr for UncertaintyMode {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "naive" => Ok(Self::Naive),
            "standard" | "realistic" => Ok(Self::Standard),
            "smearedtracks" | "smeared tracks" | "smeared-tracks" | "smeared" => {
                Ok(Self::SmearedTracks)
            }
            _ => Err(FlowError::ParseError {
                name: s.to_string(),
                object: "UncertaintyMode".to_string(),
            }),
        }
    }
}

/// Energy-resolution parameters of a calorimeter, binned in $`|\eta|`$.
///
/// The relative resolution is $`\sqrt{(S/\sqrt{E})^2 + (N/E)^2 + C^2}`$ and the angular
/// resolution is the cell granularity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalorimeterConfig {
    /// Region edges.
    pub edges: Vec<Float>,
    /// Stochastic term $`S`$.
    pub stochastic: Vec<Float>,
    /// Noise term $`N`$.
    pub noise: Vec<Float>,
    /// Constant term $`C`$.
    pub constant: Vec<Float>,
    /// Angular granularity.
    pub granularity: Vec<Float>,
}

impl CalorimeterConfig {
    /// Default electromagnetic calorimeter (barrel, endcap, forward).
    pub fn ecal() -> Self {
        Self {
            edges: vec![0.0, 1.479, 3.0, 5.2],
            stochastic: vec![0.03, 0.05, 1.0],
            noise: vec![0.12, 0.25, 0.0],
            constant: vec![0.005, 0.005, 0.1],
            granularity: vec![0.0174, 0.05, 0.175],
        }
    }

    /// Default hadronic calorimeter (barrel, endcap, forward).
    pub fn hcal() -> Self {
        Self {
            edges: vec![0.0, 1.3, 3.0, 5.2],
            stochastic: vec![1.0, 1.0, 1.8],
            noise: vec![0.0, 0.0, 0.0],
            constant: vec![0.05, 0.05, 0.1],
            granularity: vec![0.087, 0.087, 0.175],
        }
    }
}

/// Momentum and angular resolution parameters of a tracker, binned in $`|\eta|`$.
///
/// The relative momentum resolution is $`\sqrt{(L\,p_T)^2 + K^2}`$ and the angular resolution is
/// $`\sqrt{(M/p_T)^2 + A^2}`$.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Region edges.
    pub edges: Vec<Float>,
    /// Curvature term $`L`$ (1/GeV).
    pub linear: Vec<Float>,
    /// Constant term $`K`$.
    pub constant: Vec<Float>,
    /// Multiple-scattering term $`M`$ (GeV).
    pub multiple_scattering: Vec<Float>,
    /// Asymptotic angular term $`A`$.
    pub angular: Vec<Float>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            edges: vec![0.0, 0.9, 1.5, 2.5, 5.2],
            linear: vec![1.5e-4, 2e-4, 3e-4, 1e-3],
            constant: vec![0.005, 0.01, 0.02, 0.05],
            multiple_scattering: vec![0.002, 0.003, 0.004, 0.01],
            angular: vec![0.0005, 0.001, 0.002, 0.01],
        }
    }
}

/// Configuration of an [`UncertaintyModel`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UncertaintyConfig {
    /// Which model to use.
    pub mode: UncertaintyMode,
    /// Electromagnetic calorimeter (photons, electrons).
    pub ecal: CalorimeterConfig,
    /// Hadronic calorimeter (hadrons).
    pub hcal: CalorimeterConfig,
    /// Tracker (charged particles).
    pub tracker: TrackerConfig,
}

impl Default for UncertaintyConfig {
    fn default() -> Self {
        Self {
            mode: UncertaintyMode::Standard,
            ecal: CalorimeterConfig::ecal(),
            hcal: CalorimeterConfig::hcal(),
            tracker: TrackerConfig::default(),
        }
    }
}

#[derive(Clone, Debug)]
struct Calorimeter {
    name: String,
    regions: EtaRegions,
    config: CalorimeterConfig,
}

impl Calorimeter {
    fn new(name: &str, config: &CalorimeterConfig) -> FlowResult<Self> {
        let regions = EtaRegions::new(config.edges.clone())?;
        check_table_size(&format!("{name}.stochastic"), &regions, &config.stochastic)?;
        check_table_size(&format!("{name}.noise"), &regions, &config.noise)?;
        check_table_size(&format!("{name}.constant"), &regions, &config.constant)?;
        check_table_size(&format!("{name}.granularity"), &regions, &config.granularity)?;
        Ok(Self {
            name: name.to_string(),
            regions,
            config: config.clone(),
        })
    }

    fn resolution(&self, particle: &Particle) -> FlowResult<Resolution> {
        let region = self.regions.region(particle.eta, &self.name)?;
        let energy = particle.energy();
        let stochastic = self.config.stochastic[region] / energy.sqrt();
        let noise = self.config.noise[region] / energy;
        let constant = self.config.constant[region];
        let relative = (stochastic * stochastic + noise * noise + constant * constant).sqrt();
        Ok(Resolution::isotropic(
            relative * particle.pt,
            self.config.granularity[region],
        ))
    }
}

#[derive(Clone, Debug)]
struct Tracker {
    regions: EtaRegions,
    config: TrackerConfig,
}

impl Tracker {
    fn new(config: &TrackerConfig) -> FlowResult<Self> {
        let regions = EtaRegions::new(config.edges.clone())?;
        check_table_size("tracker.linear", &regions, &config.linear)?;
        check_table_size("tracker.constant", &regions, &config.constant)?;
        check_table_size(
            "tracker.multiple_scattering",
            &regions,
            &config.multiple_scattering,
        )?;
        check_table_size("tracker.angular", &regions, &config.angular)?;
        Ok(Self {
            regions,
            config: config.clone(),
        })
    }

    fn resolution(&self, particle: &Particle) -> FlowResult<Resolution> {
        let region = self.regions.region(particle.eta, "tracker")?;
        let pt = particle.pt;
        let linear = self.config.linear[region] * pt;
        let constant = self.config.constant[region];
        let scattering = self.config.multiple_scattering[region] / pt;
        let angular = self.config.angular[region];
        Ok(Resolution::isotropic(
            pt * (linear * linear + constant * constant).sqrt(),
            (scattering * scattering + angular * angular).sqrt(),
        ))
    }
}

/// The compiled calorimeter and tracker tables used by the realistic models.
#[derive(Clone, Debug)]
pub struct Detector {
    ecal: Calorimeter,
    hcal: Calorimeter,
    tracker: Tracker,
}

impl Detector {
    fn new(config: &UncertaintyConfig) -> FlowResult<Self> {
        Ok(Self {
            ecal: Calorimeter::new("ecal", &config.ecal)?,
            hcal: Calorimeter::new("hcal", &config.hcal)?,
            tracker: Tracker::new(&config.tracker)?,
        })
    }

    fn resolution(&self, particle: &Particle, smeared: bool) -> FlowResult<Resolution> {
        match particle.flavor()? {
            Flavor::Photon => self.ecal.resolution(particle),
            Flavor::NeutralHadron => self.hcal.resolution(particle),
            Flavor::Muon => self.tracker.resolution(particle),
            Flavor::Electron => Self::charged(particle, &self.tracker, &self.ecal, smeared),
            Flavor::ChargedHadron => Self::charged(particle, &self.tracker, &self.hcal, smeared),
        }
    }

    fn charged(
        particle: &Particle,
        tracker: &Tracker,
        calorimeter: &Calorimeter,
        smeared: bool,
    ) -> FlowResult<Resolution> {
        let calo = calorimeter.resolution(particle)?;
        if smeared {
            return Ok(calo);
        }
        let track = tracker.resolution(particle)?;
        Ok(Resolution {
            dpt: track.dpt.min(calo.dpt),
            ..track
        })
    }
}

/// Assigns resolutions to reconstructed particles.
#[derive(Clone, Debug)]
pub enum UncertaintyModel {
    /// See [`UncertaintyMode::Naive`].
    Naive,
    /// See [`UncertaintyMode::Standard`].
    Standard(Box<Detector>),
    /// See [`UncertaintyMode::SmearedTracks`].
    SmearedTracks(Box<Detector>),
}

impl UncertaintyModel {
    /// Build the model selected by `config.mode`, validating every table it needs.
    pub fn new(config: &UncertaintyConfig) -> FlowResult<Self> {
        Ok(match config.mode {
            UncertaintyMode::Naive => Self::Naive,
            UncertaintyMode::Standard => Self::Standard(Box::new(Detector::new(config)?)),
            UncertaintyMode::SmearedTracks => {
                Self::SmearedTracks(Box::new(Detector::new(config)?))
            }
        })
    }

    /// Compute the resolution of a particle without modifying it.
    ///
    /// Fails for particles without a positive, finite pt.
    pub fn resolution(&self, particle: &Particle) -> FlowResult<Resolution> {
        if !(particle.pt > 0.0 && particle.pt.is_finite()) {
            return Err(FlowError::Custom(format!(
                "Cannot assign a resolution to a particle with pt = {}",
                particle.pt
            )));
        }
        match self {
            Self::Naive => Ok(Resolution::isotropic(0.1 * particle.pt, 0.05)),
            Self::Standard(detector) => detector.resolution(particle, false),
            Self::SmearedTracks(detector) => detector.resolution(particle, true),
        }
    }

    /// Fill the resolution fields of `particle`.
    pub fn add_uncertainty(&self, particle: &mut Particle) -> FlowResult<()> {
        let res = self.resolution(particle)?;
        particle.dpt = res.dpt;
        particle.deta = res.deta;
        particle.dphi = res.dphi;
        Ok(())
    }

    /// Fill the resolution fields of every constituent of `jet`.
    pub fn add_uncertainties(&self, jet: &mut Jet) -> FlowResult<()> {
        jet.particles
            .iter_mut()
            .try_for_each(|particle| self.add_uncertainty(particle))
    }
}
