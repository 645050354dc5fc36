/// Useful enumerations for various frequently used flavor-like types.
pub mod enums;

use serde::{Deserialize, Serialize};

use crate::{data::Particle, FlowError, FlowResult, Float, PI};

/// Signed difference `a - b` wrapped into $`(-\pi, \pi]`$.
pub fn delta_phi(a: Float, b: Float) -> Float {
    let mut d = (a - b) % (2.0 * PI);
    if d > PI {
        d -= 2.0 * PI;
    } else if d <= -PI {
        d += 2.0 * PI;
    }
    d
}

/// Squared angular distance $`\Delta\eta^2 + \Delta\phi^2`$ between two particles.
pub fn delta_r2(a: &Particle, b: &Particle) -> Float {
    let deta = a.eta - b.eta;
    let dphi = delta_phi(a.phi, b.phi);
    deta * deta + dphi * dphi
}

/// Resolution-normalized squared distance between a reconstructed particle and a truth particle.
///
/// The residuals are divided by the resolution of `reco`; the transverse momentum term is only
/// included when `with_pt` is set.
pub fn chisquared(reco: &Particle, truth: &Particle, with_pt: bool) -> Float {
    let eta = (reco.eta - truth.eta) / reco.deta;
    let phi = delta_phi(reco.phi, truth.phi) / reco.dphi;
    let mut result = eta * eta + phi * phi;
    if with_pt {
        let pt = (reco.pt - truth.pt) / reco.dpt;
        result += pt * pt;
    }
    result
}

/// Contiguous pseudorapidity regions defined by ascending $`|\eta|`$ edges.
///
/// Region `i` covers `edges[i] <= |eta| < edges[i + 1]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EtaRegions {
    edges: Vec<Float>,
}

impl EtaRegions {
    /// Create a new set of regions, checking that the edges are ascending.
    pub fn new(edges: Vec<Float>) -> FlowResult<Self> {
        if edges.len() < 2 || edges.windows(2).any(|w| w[0] >= w[1]) {
            return Err(FlowError::Custom(format!(
                "Region edges must be at least two strictly ascending values, got {:?}",
                edges
            )));
        }
        Ok(Self { edges })
    }

    /// The number of regions.
    pub fn len(&self) -> usize {
        self.edges.len().saturating_sub(1)
    }

    /// Returns `true` if there are no regions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The region containing `|eta|`.
    pub fn region(&self, eta: Float, table: &str) -> FlowResult<usize> {
        let abs_eta = eta.abs();
        self.edges
            .windows(2)
            .position(|w| abs_eta >= w[0] && abs_eta < w[1])
            .ok_or_else(|| FlowError::EtaOutOfRange {
                eta: abs_eta,
                table: table.to_string(),
            })
    }
}

/// A table of values binned in [`EtaRegions`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BinnedTable {
    /// Region edges in $`|\eta|`$.
    pub edges: Vec<Float>,
    /// One value per region.
    pub values: Vec<Float>,
}

impl BinnedTable {
    /// Create a new table (unchecked until [`BinnedTable::compile`] is called).
    pub fn new(edges: Vec<Float>, values: Vec<Float>) -> Self {
        Self { edges, values }
    }

    /// A table with a single value everywhere inside `|eta| < eta_max`.
    pub fn constant(value: Float, eta_max: Float) -> Self {
        Self::new(vec![0.0, eta_max], vec![value])
    }

    /// Validate the table, returning the compiled lookup.
    pub fn compile(&self, name: &str) -> FlowResult<RegionTable> {
        let regions = EtaRegions::new(self.edges.clone())?;
        RegionTable::new(name, regions, self.values.clone())
    }
}

/// A validated [`BinnedTable`].
#[derive(Clone, Debug)]
pub struct RegionTable {
    name: String,
    regions: EtaRegions,
    values: Vec<Float>,
}

impl RegionTable {
    /// Pair a set of regions with one value per region.
    pub fn new(name: &str, regions: EtaRegions, values: Vec<Float>) -> FlowResult<Self> {
        check_table_size(name, &regions, &values)?;
        Ok(Self {
            name: name.to_string(),
            regions,
            values,
        })
    }

    /// Look up the value for the region containing `|eta|`.
    pub fn lookup(&self, eta: Float) -> FlowResult<Float> {
        Ok(self.values[self.regions.region(eta, &self.name)?])
    }
}

/// Check that `values` holds exactly one entry per region.
pub fn check_table_size<T>(name: &str, regions: &EtaRegions, values: &[T]) -> FlowResult<()> {
    if values.len() != regions.len() {
        return Err(FlowError::TableSizeMismatch {
            table: name.to_string(),
            expected: regions.len(),
            found: values.len(),
        });
    }
    Ok(())
}
