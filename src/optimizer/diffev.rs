//! Differential evolution solver.
//!
//! DE/rand/1/bin over a polynomial curve model. The model and the fit
//! parameters both arrive as JSON:
//!
//! ```json
//! {
//!   "parameters": [{"name": "c0", "min": -10, "max": 10},
//!                  {"name": "c1", "min": -10, "max": 10}],
//!   "x": [0, 1, 2, 3],
//!   "y": [1.0, 3.1, 4.9, 7.0],
//!   "error": [0.1, 0.1, 0.1, 0.1]
//! }
//! ```
//!
//! Parameter `i` is the coefficient of `x^i`. The figure of merit is the
//! mean squared residual, weighted by `1/error^2` when errors are given.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{SolveContext, Solver};
use crate::error::{RemoteFitError, Result};
use crate::protocol::{ParameterInfo, ProgressUpdate, ResultInfo, TerminationReason};

/// Smallest population DE/rand/1 can draw three distinct donors from
const MIN_POPULATION: usize = 4;

/// A fitted parameter and its search bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameter {
    /// Display name
    pub name: String,
    /// Lower bound
    pub min: f64,
    /// Upper bound
    pub max: f64,
}

/// Polynomial curve model with measured data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurveModel {
    /// Coefficients, lowest order first
    pub parameters: Vec<ModelParameter>,
    /// Abscissae
    pub x: Vec<f64>,
    /// Measured values
    pub y: Vec<f64>,
    /// Measurement uncertainties
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Vec<f64>>,
}

impl CurveModel {
    /// Parse and validate a model
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let model: Self = serde_json::from_slice(bytes)?;
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<()> {
        if self.parameters.is_empty() {
            return Err(invalid("model has no parameters"));
        }
        for p in &self.parameters {
            if !(p.min.is_finite() && p.max.is_finite() && p.min < p.max) {
                return Err(invalid(format!(
                    "parameter {} has invalid bounds [{}, {}]",
                    p.name, p.min, p.max
                )));
            }
        }
        if self.x.is_empty() || self.x.len() != self.y.len() {
            return Err(invalid(format!(
                "data length mismatch: {} x values, {} y values",
                self.x.len(),
                self.y.len()
            )));
        }
        if let Some(error) = &self.error {
            if error.len() != self.y.len() {
                return Err(invalid("error length does not match data"));
            }
            if error.iter().any(|e| !(*e > 0.0)) {
                return Err(invalid("errors must be positive"));
            }
        }
        Ok(())
    }

    /// Evaluate the polynomial at every `x`.
    ///
    /// Overflow saturates at `f64::MAX` / `f64::MIN` so curves always
    /// serialize; NaN becomes `f64::MAX`.
    pub fn simulate(&self, values: &[f64]) -> Vec<f64> {
        self.x
            .iter()
            .map(|&x| saturate(values.iter().rev().fold(0.0, |acc, c| acc * x + c)))
            .collect()
    }

    /// Figure of merit for a parameter vector (lower is better)
    pub fn fom(&self, values: &[f64]) -> f64 {
        let simulated = self.simulate(values);
        let sum: f64 = simulated
            .iter()
            .zip(&self.y)
            .enumerate()
            .map(|(i, (sim, meas))| {
                let weight = self.error.as_ref().map_or(1.0, |e| e[i]);
                ((meas - sim) / weight).powi(2)
            })
            .sum();
        let fom = sum / self.y.len() as f64;
        if fom.is_finite() {
            fom
        } else {
            f64::MAX
        }
    }

    fn bounds(&self) -> (Vec<f64>, Vec<f64>) {
        (
            self.parameters.iter().map(|p| p.min).collect(),
            self.parameters.iter().map(|p| p.max).collect(),
        )
    }
}

/// Differential evolution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitParams {
    /// Individuals per generation
    pub population_size: usize,
    /// Generation budget
    pub max_generations: u64,
    /// Mutation constant
    pub km: f64,
    /// Crossover constant
    pub kr: f64,
    /// Stop once the best figure of merit is at or below this (0 disables)
    pub tolerance: f64,
    /// RNG seed for reproducible runs
    pub seed: Option<u64>,
}

impl Default for FitParams {
    fn default() -> Self {
        Self {
            population_size: 30,
            max_generations: 500,
            km: 0.7,
            kr: 0.7,
            tolerance: 0.0,
            seed: None,
        }
    }
}

impl FitParams {
    /// Parse and validate fit parameters. Empty input means defaults.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let params: Self = if bytes.iter().all(u8::is_ascii_whitespace) {
            Self::default()
        } else {
            serde_json::from_slice(bytes)?
        };
        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> Result<()> {
        if self.population_size < MIN_POPULATION {
            return Err(invalid(format!(
                "population_size must be at least {MIN_POPULATION}"
            )));
        }
        if !(self.km > 0.0 && self.km <= 2.0) {
            return Err(invalid("km must be in (0, 2]"));
        }
        if !(0.0..=1.0).contains(&self.kr) {
            return Err(invalid("kr must be in [0, 1]"));
        }
        if !(self.tolerance >= 0.0) {
            return Err(invalid("tolerance must be non-negative"));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> RemoteFitError {
    RemoteFitError::Optimizer(msg.into())
}

/// DE/rand/1/bin solver
#[derive(Debug, Clone, Default)]
pub struct DifferentialEvolution;

impl DifferentialEvolution {
    /// Create the solver
    pub fn new() -> Self {
        Self
    }
}

impl Solver for DifferentialEvolution {
    fn solve(&self, model: &[u8], fit_params: &[u8], ctx: &SolveContext) -> Result<ResultInfo> {
        let model = CurveModel::from_json(model)?;
        let params = FitParams::from_json(fit_params)?;
        let mut rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let (lower, upper) = model.bounds();
        let dim = lower.len();
        let np = params.population_size;

        let mut population: Vec<Vec<f64>> = (0..np)
            .map(|_| (0..dim).map(|j| rng.gen_range(lower[j]..=upper[j])).collect())
            .collect();
        let mut foms: Vec<f64> = population.iter().map(|v| model.fom(v)).collect();
        let mut best = best_index(&foms);
        let mut fom_history = Vec::new();

        ctx.text(&format!(
            "DE started: {dim} parameters, population {np}, km {}, kr {}",
            params.km, params.kr
        ));
        ctx.parameter_info(ParameterInfo {
            names: model.parameters.iter().map(|p| p.name.clone()).collect(),
            values: population[best].clone(),
            min_values: lower.clone(),
            max_values: upper.clone(),
            population: population.clone(),
        });

        let mut generation = 0;
        let termination = loop {
            if ctx.should_stop() {
                break TerminationReason::Stopped;
            }
            if generation >= params.max_generations {
                break TerminationReason::MaxGenerations;
            }
            generation += 1;

            let previous_best = foms[best];
            for i in 0..np {
                let [a, b, c] = donors(&mut rng, np, i);
                let forced = rng.gen_range(0..dim);
                let trial: Vec<f64> = (0..dim)
                    .map(|j| {
                        if j == forced || rng.gen::<f64>() < params.kr {
                            let v = population[a][j]
                                + params.km * (population[b][j] - population[c][j]);
                            v.clamp(lower[j], upper[j])
                        } else {
                            population[i][j]
                        }
                    })
                    .collect();

                let trial_fom = model.fom(&trial);
                if trial_fom <= foms[i] {
                    population[i] = trial;
                    foms[i] = trial_fom;
                }
            }
            best = best_index(&foms);
            fom_history.push(foms[best]);

            ctx.progress(ProgressUpdate {
                generation,
                fom_history: fom_history.clone(),
                simulated: vec![model.simulate(&population[best])],
                best_values: population[best].clone(),
                new_best: foms[best] < previous_best,
            });

            if foms[best] <= params.tolerance {
                break TerminationReason::Converged;
            }
        };

        ctx.text(&format!(
            "DE finished after {generation} generations ({termination:?}), FOM {:.6e}",
            foms[best]
        ));
        Ok(ResultInfo {
            best_values: population[best].clone(),
            fom: Some(foms[best]),
            generations: generation,
            termination,
        })
    }
}

fn saturate(v: f64) -> f64 {
    if v.is_nan() {
        f64::MAX
    } else {
        v.clamp(f64::MIN, f64::MAX)
    }
}

fn best_index(foms: &[f64]) -> usize {
    foms.iter()
        .enumerate()
        .fold(0, |best, (i, f)| if *f < foms[best] { i } else { best })
}

/// Three distinct indices, all different from `target`
fn donors(rng: &mut StdRng, np: usize, target: usize) -> [usize; 3] {
    let mut picked = [target; 3];
    for k in 0..3 {
        loop {
            let candidate = rng.gen_range(0..np);
            if candidate != target && !picked[..k].contains(&candidate) {
                picked[k] = candidate;
                break;
            }
        }
    }
    picked
}
