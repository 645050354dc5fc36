use std::convert::Infallible;

use dyn_clone::DynClone;
use ganesh::{
    algorithms::LBFGSB, observers::DebugObserver, Algorithm, Function, Minimizer, Observer,
};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::Float;

/// A scalar function of a parameter vector which can be minimized.
pub trait Objective: Send + Sync {
    /// Evaluate the function at `parameters`.
    fn evaluate(&self, parameters: &[Float]) -> Float;
}

/// The outcome of a single [`Optimizer::minimize`] call.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FitStatus {
    /// Objective value at the final parameters.
    pub fx: Float,
    /// Whether the algorithm reported convergence (trivially `true` with no free parameters).
    pub converged: bool,
    /// Number of parameters that were free during the minimization.
    pub n_free: usize,
}

/// A bounded local minimizer over named parameters that can be individually fixed.
///
/// Implementors must be cheaply clonable: a clone is used as a snapshot to roll back tentative
/// refinements.
pub trait Optimizer: DynClone + Send + Sync {
    /// Register a new parameter and return its index.
    fn add_parameter(&mut self, name: &str, initial: Float, bounds: (Float, Float)) -> usize;
    /// Parameter names in registration order.
    fn names(&self) -> &[String];
    /// Current parameter values in registration order.
    fn values(&self) -> &[Float];
    /// Overwrite the value of a parameter.
    fn set_value(&mut self, index: usize, value: Float);
    /// Hold a parameter at its current value during subsequent minimizations.
    fn fix(&mut self, index: usize);
    /// Let a fixed parameter vary again.
    fn release(&mut self, index: usize);
    /// Whether a parameter is currently fixed.
    fn is_fixed(&self, index: usize) -> bool;
    /// Minimize `objective` over the free parameters, updating [`Optimizer::values`].
    fn minimize(&mut self, objective: &dyn Objective) -> FitStatus;

    /// The number of registered parameters.
    fn n_parameters(&self) -> usize {
        self.values().len()
    }
    /// The number of parameters which are not fixed.
    fn n_free(&self) -> usize {
        (0..self.n_parameters())
            .filter(|&i| !self.is_fixed(i))
            .count()
    }
}

dyn_clone::clone_trait_object!(Optimizer);

/// A set of options that are used when minimizations are performed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinimizerOptions {
    /// Maximum number of algorithm steps per minimization.
    pub max_steps: usize,
    /// Attach ganesh's [`DebugObserver`] to every minimization.
    pub debug: bool,
}

impl Default for MinimizerOptions {
    fn default() -> Self {
        Self {
            max_steps: 4000,
            debug: false,
        }
    }
}

impl MinimizerOptions {
    /// Adds the [`DebugObserver`] to the minimization.
    pub fn debug(self) -> Self {
        Self {
            debug: true,
            ..self
        }
    }

    /// Set the maximum number of algorithm steps for the minimization (default: 4000).
    pub fn with_max_steps(self, max_steps: usize) -> Self {
        Self { max_steps, ..self }
    }

    fn observers(&self) -> Vec<Box<dyn Observer<Float, ()>>> {
        if self.debug {
            vec![Box::new(DebugObserver)]
        } else {
            Vec::new()
        }
    }
}

/// Exposes the free subset of a parameter vector to ganesh.
struct FreeParameters<'a> {
    objective: &'a dyn Objective,
    template: Vec<Float>,
    free: Vec<usize>,
}

impl FreeParameters<'_> {
    fn expand(&self, x: &[Float]) -> Vec<Float> {
        let mut full = self.template.clone();
        for (&i, &value) in self.free.iter().zip(x) {
            full[i] = value;
        }
        full
    }
}

impl Function<Float, (), Infallible> for FreeParameters<'_> {
    fn evaluate(&self, x: &[Float], _user_data: &mut ()) -> Result<Float, Infallible> {
        Ok(self.objective.evaluate(&self.expand(x)))
    }
}

/// The default [`Optimizer`]: ganesh's L-BFGS-B, a limited-memory quasi-Newton minimizer which
/// supports bounded optimization.
#[derive(Clone, Debug, Default)]
pub struct LbfgsbOptimizer {
    names: Vec<String>,
    values: Vec<Float>,
    bounds: Vec<(Float, Float)>,
    fixed: Vec<bool>,
    options: MinimizerOptions,
}

impl LbfgsbOptimizer {
    /// Create an optimizer with no parameters.
    pub fn new(options: &MinimizerOptions) -> Self {
        Self {
            options: options.clone(),
            ..Default::default()
        }
    }
}

impl Optimizer for LbfgsbOptimizer {
    fn add_parameter(&mut self, name: &str, initial: Float, bounds: (Float, Float)) -> usize {
        self.names.push(name.to_string());
        self.values.push(initial.clamp(bounds.0, bounds.1));
        self.bounds.push(bounds);
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
        let (lo, hi) = self.bounds[index];
        self.values[index] = value.clamp(lo, hi);
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
        let free: Vec<usize> = (0..self.values.len()).filter(|&i| !self.fixed[i]).collect();
        if free.is_empty() {
            return FitStatus {
                fx: objective.evaluate(&self.values),
                converged: true,
                n_free: 0,
            };
        }
        let x0: Vec<Float> = free.iter().map(|&i| self.values[i]).collect();
        let bounds: Vec<(Float, Float)> = free.iter().map(|&i| self.bounds[i]).collect();
        let function = FreeParameters {
            objective,
            template: self.values.clone(),
            free,
        };
        let algorithm: Box<dyn Algorithm<Float, (), Infallible>> = Box::new(LBFGSB::default());
        let mut m = Minimizer::new_from_box(algorithm, function.free.len())
            .with_bounds(Some(bounds))
            .with_observers(self.options.observers())
            .with_max_steps(self.options.max_steps);
        m.minimize(&function, &x0, &mut ())
            .unwrap_or_else(|never| match never {});
        for (&i, &value) in function.free.iter().zip(m.status.x.iter()) {
            self.set_value(i, value);
        }
        let fx = objective.evaluate(&self.values);
        if !m.status.converged {
            warn!(
                "minimization of {} free parameters did not converge (fx = {})",
                function.free.len(),
                fx
            );
        }
        debug!(
            "minimized {} free parameters: fx = {}, converged = {}",
            function.free.len(),
            fx,
            m.status.converged
        );
        FitStatus {
            fx,
            converged: m.status.converged,
            n_free: function.free.len(),
        }
    }
}
