use std::collections::BTreeSet;

use dyn_clone::DynClone;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    data::{Jet, Particle},
    filter::CandidateFilter,
    prefit::{PrefitStrategy, Prefitter},
    refine::MatchMap,
    utils::{BinnedTable, RegionTable},
    FlowResult, Float, PI,
};

/// Moves a charged truth particle from the vertex to the calorimeter surface.
pub trait TrackPropagator: DynClone + Send + Sync + std::fmt::Debug {
    /// The particle as seen at the calorimeter, or [`None`] if it never gets there.
    fn propagate(&self, particle: &Particle) -> Option<Particle>;
}

dyn_clone::clone_trait_object!(TrackPropagator);

/// Leaves particles untouched.
#[derive(Copy, Clone, Debug, Default)]
pub struct StraightLine;

impl TrackPropagator for StraightLine {
    fn propagate(&self, particle: &Particle) -> Option<Particle> {
        Some(particle.clone())
    }
}

/// Helical propagation in a uniform solenoidal field to a cylinder of radius `radius`.
#[derive(Copy, Clone, Debug)]
pub struct HelixPropagator {
    /// Field strength in tesla.
    pub b_field: Float,
    /// Cylinder radius in meters.
    pub radius: Float,
}

impl TrackPropagator for HelixPropagator {
    fn propagate(&self, particle: &Particle) -> Option<Particle> {
        if particle.charge == 0 {
            return Some(particle.clone());
        }
        let q = particle.charge as Float;
        let arg = 0.3 * q.abs() * self.b_field * self.radius / (2.0 * particle.pt);
        if arg > 1.0 {
            return None;
        }
        let mut phi = particle.phi - q.signum() * arg.asin();
        if phi > PI {
            phi -= 2.0 * PI;
        } else if phi <= -PI {
            phi += 2.0 * PI;
        }
        Some(Particle {
            phi,
            ..particle.clone()
        })
    }
}

/// Selects a [`TrackPropagator`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PropagatorConfig {
    /// See [`StraightLine`].
    StraightLine,
    /// See [`HelixPropagator`].
    Helix {
        /// Field strength in tesla.
        b_field: Float,
        /// Calorimeter radius in meters.
        radius: Float,
    },
}

impl PropagatorConfig {
    /// Build the selected propagator.
    pub fn build(&self) -> Box<dyn TrackPropagator> {
        match self {
            Self::StraightLine => Box::new(StraightLine),
            Self::Helix { b_field, radius } => Box::new(HelixPropagator {
                b_field: *b_field,
                radius: *radius,
            }),
        }
    }
}

/// Configuration of lost-particle recovery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Offer unclaimed charged truth particles to reconstructed neutrals.
    pub recover_lost_tracks: bool,
    /// Minimum truth pt for a lost track, binned in truth $`|\eta|`$.
    pub lost_track_pt: BinnedTable,
    /// Offer unclaimed truth neutral hadrons to reconstructed photons.
    pub recover_lost_neutral_hadrons: bool,
    /// Minimum truth pt for a lost neutral hadron, binned in truth $`|\eta|`$.
    pub lost_neutral_hadron_pt: BinnedTable,
    /// Propagation applied to lost tracks before testing them.
    pub propagator: PropagatorConfig,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            recover_lost_tracks: false,
            lost_track_pt: BinnedTable::constant(1.0, 10.0),
            recover_lost_neutral_hadrons: false,
            lost_neutral_hadron_pt: BinnedTable::constant(1.0, 10.0),
            propagator: PropagatorConfig::Helix {
                b_field: 3.8,
                radius: 1.29,
            },
        }
    }
}

/// Adds candidates for truth particles the detector reconstructed under a different flavor.
#[derive(Clone, Debug)]
pub struct Recovery {
    lost_tracks: Option<RegionTable>,
    lost_neutral_hadrons: Option<RegionTable>,
    propagator: Box<dyn TrackPropagator>,
}

impl Recovery {
    /// Validate `config`.
    pub fn new(config: &RecoveryConfig) -> FlowResult<Self> {
        Ok(Self {
            lost_tracks: config
                .recover_lost_tracks
                .then(|| config.lost_track_pt.compile("lost_track_pt"))
                .transpose()?,
            lost_neutral_hadrons: config
                .recover_lost_neutral_hadrons
                .then(|| config.lost_neutral_hadron_pt.compile("lost_neutral_hadron_pt"))
                .transpose()?,
            propagator: config.propagator.build(),
        })
    }

    /// Replace the propagator used for lost tracks.
    pub fn with_propagator(self, propagator: Box<dyn TrackPropagator>) -> Self {
        Self { propagator, ..self }
    }

    /// Whether any recovery is enabled.
    pub fn is_enabled(&self) -> bool {
        self.lost_tracks.is_some() || self.lost_neutral_hadrons.is_some()
    }

    /// Extend `candidates` (reco index to truth indices) with recovered truth particles and
    /// return the number of links added.
    ///
    /// A truth particle is unclaimed when it appears in no candidate list. Unclaimed charged
    /// particles are neutralized (photon-like for electrons, neutral-hadron-like otherwise) and
    /// unclaimed neutral hadrons are turned into photons; the copy is then tested against every
    /// reconstructed particle whose prefit strategy allows matching.
    pub fn recover(
        &self,
        reco: &Jet,
        truth: &Jet,
        filter: &CandidateFilter,
        prefitter: &Prefitter,
        candidates: &mut MatchMap,
    ) -> FlowResult<usize> {
        if !self.is_enabled() {
            return Ok(0);
        }
        let claimed: BTreeSet<usize> = candidates.values().flatten().copied().collect();
        let flavors = reco.flavors()?;
        let mut added = 0;
        for (j, part) in truth.particles.iter().enumerate() {
            if claimed.contains(&j) {
                continue;
            }
            let Some(copy) = self.disguise(part)? else {
                continue;
            };
            for (i, reco_part) in reco.particles.iter().enumerate() {
                let flavor = flavors[i];
                if prefitter.strategy(flavor) == PrefitStrategy::NoMatch {
                    continue;
                }
                if filter.pass_as(flavor, reco_part, &copy)? {
                    let list = candidates.entry(i).or_default();
                    if !list.contains(&j) {
                        list.push(j);
                        list.sort_unstable();
                        added += 1;
                    }
                }
            }
        }
        if added > 0 {
            debug!("recovered {} candidate links for lost particles", added);
        }
        Ok(added)
    }

    fn disguise(&self, part: &Particle) -> FlowResult<Option<Particle>> {
        if part.charge != 0 {
            let Some(table) = &self.lost_tracks else {
                return Ok(None);
            };
            if part.pt <= table.lookup(part.eta)? {
                return Ok(None);
            }
            Ok(self.propagator.propagate(part).map(|propagated| Particle {
                pdgid: if part.pdgid == 11 { 22 } else { 130 },
                charge: 0,
                ..propagated
            }))
        } else if part.pdgid >= 100 {
            let Some(table) = &self.lost_neutral_hadrons else {
                return Ok(None);
            };
            if part.pt <= table.lookup(part.eta)? {
                return Ok(None);
            }
            Ok(Some(Particle {
                pdgid: 22,
                ..part.clone()
            }))
        } else {
            Ok(None)
        }
    }
}
