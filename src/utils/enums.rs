use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{FlowError, FlowResult};

/// The particle taxonomy used to dispatch every per-flavor strategy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Flavor {
    /// A photon (pdgid 22).
    Photon,
    /// Any neutral hadron (pdgid >= 100, zero charge).
    NeutralHadron,
    /// Any charged hadron (pdgid >= 100, nonzero charge).
    ChargedHadron,
    /// An electron or positron (pdgid 11).
    Electron,
    /// A muon (pdgid 13).
    Muon,
}

impl Flavor {
    /// Every flavor, in ensemble order.
    pub const ALL: [Flavor; 5] = [
        Flavor::Photon,
        Flavor::NeutralHadron,
        Flavor::ChargedHadron,
        Flavor::Electron,
        Flavor::Muon,
    ];

    /// Classify a particle from its absolute particle-type code and charge.
    pub fn from_ids(pdgid: u32, charge: i32) -> FlowResult<Self> {
        match pdgid {
            22 => Ok(Self::Photon),
            11 => Ok(Self::Electron),
            13 => Ok(Self::Muon),
            p if p >= 100 && charge == 0 => Ok(Self::NeutralHadron),
            p if p >= 100 => Ok(Self::ChargedHadron),
            _ => Err(FlowError::UnknownFlavor { pdgid, charge }),
        }
    }
}

impl Display for Flavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Flavor::Photon => write!(f, "Photon"),
            Flavor::NeutralHadron => write!(f, "Neutral Hadron"),
            Flavor::ChargedHadron => write!(f, "Charged Hadron"),
            Flavor::Electron => write!(f, "Electron"),
            Flavor::Muon => write!(f, "Muon"),
        }
    }
}

impl FromStr for Flavor {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "photon" | "em0" | "gamma" => Ok(Self::Photon),
            "neutralhadron" | "neutral hadron" | "neutral-hadron" | "had0" => {
                Ok(Self::NeutralHadron)
            }
            "chargedhadron" | "charged hadron" | "charged-hadron" | "hadch" => {
                Ok(Self::ChargedHadron)
            }
            "electron" | "ele" | "e" => Ok(Self::Electron),
            "muon" | "mu" => Ok(Self::Muon),
            _ => Err(FlowError::ParseError {
                name: s.to_string(),
                object: "Flavor".to_string(),
            }),
        }
    }
}

/// One value per [`Flavor`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerFlavor<T> {
    /// Value used for photons.
    pub photon: T,
    /// Value used for neutral hadrons.
    pub neutral_hadron: T,
    /// Value used for charged hadrons.
    pub charged_hadron: T,
    /// Value used for electrons.
    pub electron: T,
    /// Value used for muons.
    pub muon: T,
}

impl<T> PerFlavor<T> {
    /// Use the same value for every flavor.
    pub fn splat(value: T) -> Self
    where
        T: Clone,
    {
        Self {
            photon: value.clone(),
            neutral_hadron: value.clone(),
            charged_hadron: value.clone(),
            electron: value.clone(),
            muon: value,
        }
    }

    /// The value belonging to `flavor`.
    pub fn get(&self, flavor: Flavor) -> &T {
        match flavor {
            Flavor::Photon => &self.photon,
            Flavor::NeutralHadron => &self.neutral_hadron,
            Flavor::ChargedHadron => &self.charged_hadron,
            Flavor::Electron => &self.electron,
            Flavor::Muon => &self.muon,
        }
    }

    /// Apply a fallible conversion to every member, keeping the flavor layout.
    pub fn try_map<U, F>(&self, mut f: F) -> FlowResult<PerFlavor<U>>
    where
        F: FnMut(&T) -> FlowResult<U>,
    {
        Ok(PerFlavor {
            photon: f(&self.photon)?,
            neutral_hadron: f(&self.neutral_hadron)?,
            charged_hadron: f(&self.charged_hadron)?,
            electron: f(&self.electron)?,
            muon: f(&self.muon)?,
        })
    }
}

impl<T> TryFrom<Vec<T>> for PerFlavor<T> {
    type Error = FlowError;

    /// Build an ensemble from members listed in [`Flavor::ALL`] order.
    fn try_from(members: Vec<T>) -> Result<Self, Self::Error> {
        let found = members.len();
        let shape_error = || FlowError::EnsembleShape {
            expected: Flavor::ALL.len(),
            found,
        };
        if found != Flavor::ALL.len() {
            return Err(shape_error());
        }
        let mut members = members.into_iter();
        let mut next = || members.next().ok_or_else(shape_error);
        Ok(Self {
            photon: next()?,
            neutral_hadron: next()?,
            charged_hadron: next()?,
            electron: next()?,
            muon: next()?,
        })
    }
}

/// Selects which particles a refinement step may act on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticleFilter {
    /// Every particle.
    All,
    /// No particle.
    None,
    /// Particles with nonzero charge.
    Charged,
    /// Particles with zero charge.
    Neutral,
    /// Photons only (pdgid 22).
    Photon,
    /// Detector-level neutral hadrons only (pdgid 130). Other neutral hadrons such as neutrons
    /// are not selected.
    NeutralHadron,
    /// Photons and pdgid-130 neutral hadrons.
    PhotonNeutralHadron,
    /// Photons and charged particles.
    PhotonCharged,
    /// Pdgid-130 neutral hadrons and charged particles.
    NeutralHadronCharged,
}

impl ParticleFilter {
    /// Whether a particle with the given type code and charge is selected.
    ///
    /// Classification is done on (pdgid, charge) directly so that truth particles of flavors
    /// outside the [`Flavor`] taxonomy can still be filtered.
    pub fn accepts(&self, pdgid: u32, charge: i32) -> bool {
        let photon = pdgid == 22;
        let charged = charge != 0;
        let neutral_hadron = pdgid == 130;
        match self {
            Self::All => true,
            Self::None => false,
            Self::Charged => charged,
            Self::Neutral => !charged,
            Self::Photon => photon,
            Self::NeutralHadron => neutral_hadron,
            Self::PhotonNeutralHadron => photon || neutral_hadron,
            Self::PhotonCharged => photon || charged,
            Self::NeutralHadronCharged => neutral_hadron || charged,
        }
    }
}

impl Display for ParticleFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParticleFilter::All => write!(f, "All"),
            ParticleFilter::None => write!(f, "None"),
            ParticleFilter::Charged => write!(f, "Charged"),
            ParticleFilter::Neutral => write!(f, "Neutral"),
            ParticleFilter::Photon => write!(f, "Photon"),
            ParticleFilter::NeutralHadron => write!(f, "Neutral Hadron"),
            ParticleFilter::PhotonNeutralHadron => write!(f, "Photon + Neutral Hadron"),
            ParticleFilter::PhotonCharged => write!(f, "Photon + Charged"),
            ParticleFilter::NeutralHadronCharged => write!(f, "Neutral Hadron + Charged"),
        }
    }
}

impl FromStr for ParticleFilter {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all" => Ok(Self::All),
            "none" => Ok(Self::None),
            "charged" => Ok(Self::Charged),
            "neutral" => Ok(Self::Neutral),
            "photon" | "em0" => Ok(Self::Photon),
            "neutralhadron" | "neutral hadron" | "had0" => Ok(Self::NeutralHadron),
            "photonneutralhadron" | "em0had0" => Ok(Self::PhotonNeutralHadron),
            "photoncharged" | "em0charged" => Ok(Self::PhotonCharged),
            "neutralhadroncharged" | "had0charged" => Ok(Self::NeutralHadronCharged),
            _ => Err(FlowError::ParseError {
                name: s.to_string(),
                object: "ParticleFilter".to_string(),
            }),
        }
    }
}
