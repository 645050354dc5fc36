use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    data::{Jet, Particle},
    utils::{chisquared, enums::Flavor},
    FlowError, FlowResult, Float,
};

/// A sparse bipartite map from particle indices on one side to indices on the other, ordered by
/// key.
pub type MatchMap = BTreeMap<usize, Vec<usize>>;

/// Invert a reco-to-truth map into a truth-to-reco map.
///
/// Every reconstructed index appears in the lists of the truth particles it points to, in
/// ascending reconstructed order. Empty lists are dropped.
pub fn invert(reco_to_truth: &MatchMap) -> MatchMap {
    let mut truth_to_reco = MatchMap::new();
    for (&i, candidates) in reco_to_truth {
        for &j in candidates {
            truth_to_reco.entry(j).or_default().push(i);
        }
    }
    truth_to_reco
}

/// How overlapping candidate lists are resolved before fitting.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefinerStrategy {
    /// Keep every candidate.
    #[default]
    None,
    /// Keep only the reconstructed particle closest to each truth particle.
    OneGenOneReco,
    /// Keep the closest charged, photon, and neutral-hadron reconstructed particle for each truth
    /// particle.
    OneGenOneRecoPerType,
}

impl Display for RefinerStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefinerStrategy::None => write!(f, "None"),
            RefinerStrategy::OneGenOneReco => write!(f, "One Gen One Reco"),
            RefinerStrategy::OneGenOneRecoPerType => write!(f, "One Gen One Reco Per Type"),
        }
    }
}

impl FromStr for RefinerStrategy {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace([' ', '-', '_'], "").as_str() {
            "none" => Ok(Self::None),
            "onegenonereco" | "1g1r" => Ok(Self::OneGenOneReco),
            "onegenonerecopertype" | "1g1rpertype" => Ok(Self::OneGenOneRecoPerType),
            _ => Err(FlowError::ParseError {
                name: s.to_string(),
                object: "RefinerStrategy".to_string(),
            }),
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum Population {
    Charged,
    Photon,
    NeutralHadron,
}

impl From<Flavor> for Population {
    fn from(flavor: Flavor) -> Self {
        match flavor {
            Flavor::Photon => Self::Photon,
            Flavor::NeutralHadron => Self::NeutralHadron,
            Flavor::ChargedHadron | Flavor::Electron | Flavor::Muon => Self::Charged,
        }
    }
}

fn closest(candidates: &[usize], reco: &[Particle], truth: &Particle) -> Option<usize> {
    let mut best: Option<(usize, Float)> = None;
    for &i in candidates {
        let value = chisquared(&reco[i], truth, false);
        if best.map_or(true, |(_, current)| value < current) {
            best = Some((i, value));
        }
    }
    best.map(|(i, _)| i)
}

impl RefinerStrategy {
    /// Turn a reco-to-truth candidate map into the truth-to-reco map used to build the fit.
    pub fn refine(&self, reco_to_truth: &MatchMap, reco: &Jet, truth: &Jet) -> FlowResult<MatchMap> {
        let inverted = invert(reco_to_truth);
        match self {
            Self::None => Ok(inverted),
            Self::OneGenOneReco => Ok(inverted
                .into_iter()
                .filter_map(|(j, candidates)| {
                    closest(&candidates, &reco.particles, &truth.particles[j])
                        .map(|i| (j, vec![i]))
                })
                .collect()),
            Self::OneGenOneRecoPerType => {
                let mut refined = MatchMap::new();
                for (j, candidates) in inverted {
                    let mut populations = Vec::with_capacity(candidates.len());
                    for &i in &candidates {
                        populations.push(Population::from(reco.particles[i].flavor()?));
                    }
                    let kept: Vec<usize> = [
                        Population::Charged,
                        Population::Photon,
                        Population::NeutralHadron,
                    ]
                    .into_iter()
                    .filter_map(|population| {
                        let members: Vec<usize> = candidates
                            .iter()
                            .zip(&populations)
                            .filter(|(_, p)| **p == population)
                            .map(|(&i, _)| i)
                            .collect();
                        closest(&members, &reco.particles, &truth.particles[j])
                    })
                    .collect();
                    refined.insert(j, kept);
                }
                Ok(refined)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reco_jet() -> Jet {
        Jet::new(vec![
            Particle::new(10.0, 0.0, 0.2, 22, 0).with_resolution(1.0, 0.1, 0.1),
            Particle::new(10.0, 0.0, 0.1, 22, 0).with_resolution(1.0, 0.1, 0.1),
            Particle::new(10.0, 0.0, 0.3, 211, 1).with_resolution(1.0, 0.1, 0.1),
            Particle::new(10.0, 0.0, 0.4, 130, 0).with_resolution(1.0, 0.1, 0.1),
        ])
    }

    fn truth_jet() -> Jet {
        Jet::new(vec![
            Particle::new(10.0, 0.0, 0.0, 211, 1),
            Particle::new(10.0, 0.0, 0.5, 22, 0),
        ])
    }

    fn candidates() -> MatchMap {
        MatchMap::from([
            (0, vec![0]),
            (1, vec![0]),
            (2, vec![0, 1]),
            (3, vec![0, 1]),
        ])
    }

    #[test]
    fn enum_from_str() {
        assert_eq!(
            RefinerStrategy::from_str("OneGenOneReco").unwrap(),
            RefinerStrategy::OneGenOneReco
        );
        assert_eq!(
            RefinerStrategy::from_str("one gen one reco per type").unwrap(),
            RefinerStrategy::OneGenOneRecoPerType
        );
        assert!(RefinerStrategy::from_str("greedy").is_err());
    }

    #[test]
    fn test_invert() {
        let inverted = invert(&candidates());
        assert_eq!(inverted[&0], vec![0, 1, 2, 3]);
        assert_eq!(inverted[&1], vec![2, 3]);
        assert!(invert(&MatchMap::from([(0, vec![])])).is_empty());
    }

    #[test]
    fn test_none_keeps_everything() {
        let refined = RefinerStrategy::None
            .refine(&candidates(), &reco_jet(), &truth_jet())
            .unwrap();
        assert_eq!(refined, invert(&candidates()));
    }

    #[test]
    fn test_one_gen_one_reco() {
        let refined = RefinerStrategy::OneGenOneReco
            .refine(&candidates(), &reco_jet(), &truth_jet())
            .unwrap();
        assert_eq!(refined[&0], vec![1]);
        assert_eq!(refined[&1], vec![3]);
    }

    #[test]
    fn test_one_gen_one_reco_per_type() {
        let refined = RefinerStrategy::OneGenOneRecoPerType
            .refine(&candidates(), &reco_jet(), &truth_jet())
            .unwrap();
        assert_eq!(refined[&0], vec![2, 1, 3]);
        assert_eq!(refined[&1], vec![2, 3]);
    }

    #[test]
    fn test_unknown_flavor() {
        let mut reco = reco_jet();
        reco.particles[3].pdgid = 15;
        assert!(RefinerStrategy::OneGenOneRecoPerType
            .refine(&candidates(), &reco, &truth_jet())
            .is_err());
    }
}
