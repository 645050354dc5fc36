#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::{
    data::Jet,
    matcher::{MatchResult, Matcher},
    utils::delta_phi,
    FlowResult, Float, MatchingConfig,
};

fn jet_delta_r2(a: &Jet, b: &Jet) -> Float {
    let deta = a.eta - b.eta;
    let dphi = delta_phi(a.phi, b.phi);
    deta * deta + dphi * dphi
}

/// Pair reconstructed jets with truth jets one-to-one.
///
/// Reconstructed jets are visited in decreasing pt and take the closest unused truth jet within
/// `dr_max`. Returns (reco, truth) index pairs in visiting order.
pub fn match_jets(reco: &[Jet], truth: &[Jet], dr_max: Float) -> Vec<(usize, usize)> {
    let mut order: Vec<usize> = (0..reco.len()).collect();
    order.sort_by(|&a, &b| reco[b].pt.total_cmp(&reco[a].pt));
    let mut used = vec![false; truth.len()];
    let mut pairs = Vec::new();
    for i in order {
        let mut best: Option<(usize, Float)> = None;
        for (j, truth_jet) in truth.iter().enumerate() {
            if used[j] {
                continue;
            }
            let dr2 = jet_delta_r2(&reco[i], truth_jet);
            if dr2 < dr_max * dr_max && best.map_or(true, |(_, current)| dr2 < current) {
                best = Some((j, dr2));
            }
        }
        if let Some((j, _)) = best {
            used[j] = true;
            pairs.push((i, j));
        }
    }
    pairs
}

/// Fit every (reco, truth) jet pair independently, in parallel when the `rayon` feature is
/// enabled. Results are returned in the order of `pairs`.
pub fn process_pairs(
    reco: &[Jet],
    truth: &[Jet],
    pairs: &[(usize, usize)],
    config: &MatchingConfig,
) -> Vec<FlowResult<MatchResult>> {
    let fit = |&(i, j): &(usize, usize)| Matcher::fit(&reco[i], &truth[j], config)?.result();
    #[cfg(feature = "rayon")]
    return pairs.par_iter().map(fit).collect();
    #[cfg(not(feature = "rayon"))]
    return pairs.iter().map(fit).collect();
}

/// Pair the jets of one event with [`match_jets`] and fit each pair with [`process_pairs`].
pub fn match_event(
    reco: &[Jet],
    truth: &[Jet],
    dr_max: Float,
    config: &MatchingConfig,
) -> Vec<((usize, usize), FlowResult<MatchResult>)> {
    let pairs = match_jets(reco, truth, dr_max);
    let results = process_pairs(reco, truth, &pairs, config);
    pairs.into_iter().zip(results).collect()
}
