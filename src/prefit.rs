use std::{fmt::Display, str::FromStr};

use log::trace;
use serde::{Deserialize, Serialize};

use crate::{
    data::{Jet, Particle},
    filter::CandidateFilter,
    utils::{
        chisquared, delta_r2,
        enums::{Flavor, PerFlavor},
    },
    FlowError, FlowResult, Float,
};

/// How the admissible truth candidates of a reconstructed particle are reduced.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrefitStrategy {
    /// Never match.
    NoMatch,
    /// Keep the admissible candidate with the smallest $`\Delta R`$.
    Closest,
    /// Keep the admissible candidate with the highest pt.
    Hardest,
    /// Keep the admissible candidate with the smallest resolution-normalized chi-square
    /// (pt, eta, and phi).
    Best,
    /// Keep every admissible candidate and let the fit share the momentum.
    Float,
}

impl Display for PrefitStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrefitStrategy::NoMatch => write!(f, "No Match"),
            PrefitStrategy::Closest => write!(f, "Closest"),
            PrefitStrategy::Hardest => write!(f, "Hardest"),
            PrefitStrategy::Best => write!(f, "Best"),
            PrefitStrategy::Float => write!(f, "Float"),
        }
    }
}

impl FromStr for PrefitStrategy {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nomatch" | "no match" | "none" => Ok(Self::NoMatch),
            "closest" | "dr" => Ok(Self::Closest),
            "hardest" | "pt" => Ok(Self::Hardest),
            "best" | "chisq" => Ok(Self::Best),
            "float" | "all" => Ok(Self::Float),
            _ => Err(FlowError::ParseError {
                name: s.to_string(),
                object: "PrefitStrategy".to_string(),
            }),
        }
    }
}

impl PrefitStrategy {
    /// Reduce the candidates of `reco` in `truth` using `filter`.
    ///
    /// Candidates are visited in index order and only a strictly better candidate replaces the
    /// current choice, so ties resolve to the lowest index.
    pub fn prefit(
        &self,
        flavor: Flavor,
        reco: &Particle,
        truth: &Jet,
        filter: &CandidateFilter,
    ) -> FlowResult<Vec<usize>> {
        let score: fn(&Particle, &Particle) -> Float = match self {
            Self::NoMatch => return Ok(Vec::new()),
            Self::Float => {
                let mut result = Vec::new();
                for (j, part) in truth.particles.iter().enumerate() {
                    if filter.pass_as(flavor, reco, part)? {
                        result.push(j);
                    }
                }
                return Ok(result);
            }
            Self::Closest => delta_r2,
            Self::Hardest => |_: &Particle, part: &Particle| -part.pt,
            Self::Best => |reco: &Particle, part: &Particle| chisquared(reco, part, true),
        };
        let mut best: Option<(usize, Float)> = None;
        for (j, part) in truth.particles.iter().enumerate() {
            if !filter.pass_as(flavor, reco, part)? {
                continue;
            }
            let value = score(reco, part);
            if best.map_or(true, |(_, current)| value < current) {
                best = Some((j, value));
            }
        }
        Ok(best.map(|(j, _)| vec![j]).unwrap_or_default())
    }
}

/// Per-flavor prefit configuration.
pub type PrefitConfig = PerFlavor<PrefitStrategy>;

impl Default for PrefitConfig {
    fn default() -> Self {
        PerFlavor::splat(PrefitStrategy::Float)
    }
}

/// The prefit ensemble: one [`PrefitStrategy`] per reconstructed flavor.
#[derive(Clone, Debug)]
pub struct Prefitter {
    strategies: PrefitConfig,
}

impl Prefitter {
    /// Create a new ensemble.
    pub fn new(config: &PrefitConfig) -> Self {
        Self {
            strategies: config.clone(),
        }
    }

    /// Build the ensemble from strategies listed in [`Flavor::ALL`] order.
    pub fn from_members(members: Vec<PrefitStrategy>) -> FlowResult<Self> {
        Ok(Self::new(&PerFlavor::try_from(members)?))
    }

    /// The strategy used for reconstructed particles of `flavor`.
    pub fn strategy(&self, flavor: Flavor) -> PrefitStrategy {
        *self.strategies.get(flavor)
    }

    /// Candidate truth indices for `reco`, dispatching on its flavor.
    pub fn prefit(
        &self,
        reco: &Particle,
        truth: &Jet,
        filter: &CandidateFilter,
    ) -> FlowResult<Vec<usize>> {
        let flavor = reco.flavor()?;
        let result = self.strategy(flavor).prefit(flavor, reco, truth, filter)?;
        trace!(
            "prefit {} (pt = {:.2}) with {}: {:?}",
            flavor,
            reco.pt,
            self.strategy(flavor),
            result
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{AngularConfig, FilterConfig, FlavorCheck, FlavorFilter};

    fn open_filter() -> CandidateFilter {
        let mut config = FilterConfig::default();
        config.photon.flavor = FlavorCheck::uniform(FlavorFilter::Photon);
        config.photon.angular = AngularConfig::cone(0.5, 5.0);
        CandidateFilter::new(&config).unwrap()
    }

    fn photon_jet() -> Jet {
        Jet::new(vec![
            Particle::new(4.0, 0.0, 0.1, 22, 0),
            Particle::new(20.0, 0.0, 0.3, 22, 0),
            Particle::new(9.0, 0.0, 0.05, 22, 0),
            Particle::new(9.0, 0.0, 0.0, 130, 0),
            Particle::new(9.0, 0.0, 1.0, 22, 0),
        ])
    }

    fn reco_photon() -> Particle {
        Particle::new(10.0, 0.0, 0.0, 22, 0).with_resolution(1.0, 0.1, 0.1)
    }

    #[test]
    fn enum_from_str() {
        assert_eq!(PrefitStrategy::from_str("No Match").unwrap(), PrefitStrategy::NoMatch);
        assert_eq!(PrefitStrategy::from_str("BEST").unwrap(), PrefitStrategy::Best);
        assert!(PrefitStrategy::from_str("nearest").is_err());
        assert_eq!(format!("{}", PrefitStrategy::NoMatch), "No Match");
    }

    #[test]
    fn test_strategies() {
        let filter = open_filter();
        let jet = photon_jet();
        let reco = reco_photon();
        let run = |strategy: PrefitStrategy| {
            strategy
                .prefit(Flavor::Photon, &reco, &jet, &filter)
                .unwrap()
        };
        assert!(run(PrefitStrategy::NoMatch).is_empty());
        assert_eq!(run(PrefitStrategy::Float), vec![0, 1, 2]);
        assert_eq!(run(PrefitStrategy::Closest), vec![2]);
        assert_eq!(run(PrefitStrategy::Hardest), vec![1]);
        assert_eq!(run(PrefitStrategy::Best), vec![2]);
    }

    #[test]
    fn test_ties_keep_first() {
        let filter = open_filter();
        let jet = Jet::new(vec![
            Particle::new(5.0, 0.0, 0.1, 22, 0),
            Particle::new(5.0, 0.0, -0.1, 22, 0),
        ]);
        let reco = reco_photon();
        for strategy in [
            PrefitStrategy::Closest,
            PrefitStrategy::Hardest,
            PrefitStrategy::Best,
        ] {
            assert_eq!(
                strategy
                    .prefit(Flavor::Photon, &reco, &jet, &filter)
                    .unwrap(),
                vec![0]
            );
        }
    }

    #[test]
    fn test_no_admissible_candidates() {
        let filter = open_filter();
        let jet = Jet::new(vec![Particle::new(5.0, 0.0, 0.1, 130, 0)]);
        let prefitter = Prefitter::new(&PrefitConfig::default());
        assert!(prefitter
            .prefit(&reco_photon(), &jet, &filter)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_ensemble_dispatch() {
        let filter = open_filter();
        let prefitter = Prefitter::from_members(vec![
            PrefitStrategy::Hardest,
            PrefitStrategy::NoMatch,
            PrefitStrategy::NoMatch,
            PrefitStrategy::NoMatch,
            PrefitStrategy::NoMatch,
        ])
        .unwrap();
        assert_eq!(
            prefitter
                .prefit(&reco_photon(), &photon_jet(), &filter)
                .unwrap(),
            vec![1]
        );
        assert!(Prefitter::from_members(vec![PrefitStrategy::Float]).is_err());
    }
}
