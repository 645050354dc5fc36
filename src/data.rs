use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::{utils::enums::Flavor, FlowResult, Float};

/// A single reconstructed or generator-level particle.
///
/// The resolution fields (`dpt`, `deta`, `dphi`) start at zero and are filled in by an
/// [`UncertaintyModel`](crate::uncertainty::UncertaintyModel). Only reconstructed particles
/// carry meaningful resolutions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    /// Transverse momentum (GeV).
    pub pt: Float,
    /// Pseudorapidity.
    pub eta: Float,
    /// Azimuthal angle.
    pub phi: Float,
    /// Absolute resolution on `pt`.
    pub dpt: Float,
    /// Absolute resolution on `eta`.
    pub deta: Float,
    /// Absolute resolution on `phi`.
    pub dphi: Float,
    /// Absolute particle-type code.
    pub pdgid: u32,
    /// Electric charge.
    pub charge: i32,
}

impl Particle {
    /// Create a particle without resolution information.
    pub fn new(pt: Float, eta: Float, phi: Float, pdgid: u32, charge: i32) -> Self {
        Self {
            pt,
            eta,
            phi,
            pdgid,
            charge,
            ..Default::default()
        }
    }

    /// Attach explicit resolutions.
    pub fn with_resolution(mut self, dpt: Float, deta: Float, dphi: Float) -> Self {
        self.dpt = dpt;
        self.deta = deta;
        self.dphi = dphi;
        self
    }

    /// The [`Flavor`] of this particle.
    pub fn flavor(&self) -> FlowResult<Flavor> {
        Flavor::from_ids(self.pdgid, self.charge)
    }

    /// Total energy of a massless particle with these kinematics.
    pub fn energy(&self) -> Float {
        self.pt * self.eta.cosh()
    }
}

/// A jet: an ordered list of constituent particles plus the jet axis.
///
/// Particles are referenced everywhere by their index in [`Jet::particles`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Jet {
    /// Jet transverse momentum.
    pub pt: Float,
    /// Jet pseudorapidity.
    pub eta: Float,
    /// Jet azimuthal angle.
    pub phi: Float,
    /// Constituents.
    pub particles: Vec<Particle>,
}

impl Jet {
    /// Build a jet from its constituents, computing the axis as the pt-weighted centroid.
    pub fn new(particles: Vec<Particle>) -> Self {
        let pt: Float = particles.iter().map(|p| p.pt).sum();
        let (eta, phi) = if pt > 0.0 {
            let eta = particles.iter().map(|p| p.pt * p.eta).sum::<Float>() / pt;
            let (sin, cos) = particles.iter().fold((0.0, 0.0), |(s, c), p| {
                (s + p.pt * p.phi.sin(), c + p.pt * p.phi.cos())
            });
            (eta, sin.atan2(cos))
        } else {
            (0.0, 0.0)
        };
        Self {
            pt,
            eta,
            phi,
            particles,
        }
    }

    /// The number of constituents.
    pub fn n_part(&self) -> usize {
        self.particles.len()
    }

    /// Constituent transverse momenta.
    pub fn pt_vec(&self) -> DVector<Float> {
        DVector::from_iterator(self.n_part(), self.particles.iter().map(|p| p.pt))
    }

    /// Constituent pseudorapidities.
    pub fn eta_vec(&self) -> DVector<Float> {
        DVector::from_iterator(self.n_part(), self.particles.iter().map(|p| p.eta))
    }

    /// Constituent azimuthal angles.
    pub fn phi_vec(&self) -> DVector<Float> {
        DVector::from_iterator(self.n_part(), self.particles.iter().map(|p| p.phi))
    }

    /// The flavor of every constituent, failing on the first unknown one.
    pub fn flavors(&self) -> FlowResult<Vec<Flavor>> {
        self.particles.iter().map(Particle::flavor).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_jet_axis() {
        let jet = Jet::new(vec![
            Particle::new(30.0, 0.2, 0.1, 211, 1),
            Particle::new(10.0, -0.2, 0.1, 22, 0),
        ]);
        assert_eq!(jet.n_part(), 2);
        assert_relative_eq!(jet.pt, 40.0);
        assert_relative_eq!(jet.eta, 0.1, epsilon = 1e-12);
        assert_relative_eq!(jet.phi, 0.1, epsilon = 1e-12);
        assert_relative_eq!(jet.pt_vec()[1], 10.0);
    }

    #[test]
    fn test_jet_axis_across_boundary() {
        let jet = Jet::new(vec![
            Particle::new(10.0, 0.0, 3.1, 22, 0),
            Particle::new(10.0, 0.0, -3.1, 22, 0),
        ]);
        assert!(jet.phi.abs() > 3.1);
    }

    #[test]
    fn test_empty_jet() {
        let jet = Jet::new(vec![]);
        assert_eq!(jet.n_part(), 0);
        assert_relative_eq!(jet.pt, 0.0);
    }

    #[test]
    fn test_flavors() {
        let jet = Jet::new(vec![
            Particle::new(30.0, 0.2, 0.1, 211, 1),
            Particle::new(10.0, -0.2, 0.1, 15, -1),
        ]);
        assert!(jet.flavors().is_err());
    }
}
