use std::fs;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use ensemble_core::{Agent, AgentFactory, AgentVariant, EnsembleError, Environment, Result};

/// Random-search hyperparameters for one agent variant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    /// Scale of the perturbation applied to each weight.
    pub noise: f64,
    pub step_size: f64,
    /// Largest absolute change to any weight in one update. `None` = unbounded.
    pub max_update: Option<f64>,
}

impl SearchParams {
    pub fn for_variant(variant: AgentVariant) -> Self {
        match variant {
            AgentVariant::PolicyGradient => Self {
                noise: 0.05,
                step_size: 0.02,
                max_update: None,
            },
            AgentVariant::ActorCritic => Self {
                noise: 0.03,
                step_size: 0.01,
                max_update: None,
            },
            AgentVariant::OffPolicy => Self {
                noise: 0.1,
                step_size: 0.03,
                max_update: None,
            },
            AgentVariant::TrustRegion => Self {
                noise: 0.02,
                step_size: 0.01,
                max_update: Some(0.005),
            },
        }
    }
}

/// Linear policy `tanh(W · softsign(obs) + b)`, one row per instrument.
///
/// Trained by antithetic random search: each update perturbs the weights in
/// one random direction, runs an episode either side and moves toward the
/// better one. Timesteps count environment steps across all rollouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearPolicyAgent {
    variant: AgentVariant,
    stock_dimension: usize,
    params: SearchParams,
    seed: u64,
    /// `stock_dimension` rows of `observation_len + 1` (bias last).
    weights: Vec<Vec<f64>>,
}

impl LinearPolicyAgent {
    pub fn new(variant: AgentVariant, stock_dimension: usize, seed: u64) -> Self {
        Self {
            variant,
            stock_dimension,
            params: SearchParams::for_variant(variant),
            seed,
            weights: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: SearchParams) -> Self {
        self.params = params;
        self
    }

    pub fn is_trained(&self) -> bool {
        !self.weights.is_empty()
    }

    pub fn weights(&self) -> &[Vec<f64>] {
        &self.weights
    }

    fn act(weights: &[Vec<f64>], observation: &[f64]) -> Vec<f64> {
        weights
            .iter()
            .map(|row| {
                let (bias, w) = row.split_last().map_or((0.0, &row[..]), |(b, w)| (*b, w));
                let z: f64 = w
                    .iter()
                    .zip(observation)
                    .map(|(w, x)| w * softsign(*x))
                    .sum();
                (z + bias).tanh()
            })
            .collect()
    }

    /// One episode under `weights`. Returns total reward and steps taken.
    fn rollout(
        env: &mut dyn Environment,
        weights: &[Vec<f64>],
        budget: u64,
    ) -> Result<(f64, u64)> {
        let mut observation = env.reset()?;
        let mut total = 0.0;
        let mut steps = 0;
        while steps < budget {
            let outcome = env.step(&Self::act(weights, &observation))?;
            steps += 1;
            total += outcome.reward;
            if outcome.done {
                break;
            }
            observation = outcome.observation;
        }
        Ok((total, steps))
    }
}

fn softsign(x: f64) -> f64 {
    if x.is_finite() {
        x / (1.0 + x.abs())
    } else {
        0.0
    }
}

impl Agent for LinearPolicyAgent {
    fn variant(&self) -> AgentVariant {
        self.variant
    }

    fn learn(&mut self, env: &mut dyn Environment, total_timesteps: u64) -> Result<()> {
        if env.action_dimension() != self.stock_dimension {
            return Err(EnsembleError::Agent(format!(
                "{} agent built for {} instruments, environment trades {}",
                self.variant,
                self.stock_dimension,
                env.action_dimension()
            )));
        }

        let observation_len = env.reset()?.len();
        if self.weights.first().map(|r| r.len()) != Some(observation_len + 1) {
            self.weights = vec![vec![0.0; observation_len + 1]; self.stock_dimension];
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let SearchParams {
            noise,
            step_size,
            max_update,
        } = self.params;

        let mut used = 0u64;
        let mut updates = 0usize;
        while used < total_timesteps {
            let direction: Vec<Vec<f64>> = self
                .weights
                .iter()
                .map(|row| row.iter().map(|_| rng.gen_range(-1.0..1.0)).collect())
                .collect();
            let shifted = |sign: f64| -> Vec<Vec<f64>> {
                self.weights
                    .iter()
                    .zip(&direction)
                    .map(|(row, d)| {
                        row.iter()
                            .zip(d)
                            .map(|(w, d)| w + sign * noise * d)
                            .collect()
                    })
                    .collect()
            };

            let (up, up_steps) = Self::rollout(env, &shifted(1.0), total_timesteps - used)?;
            used += up_steps;
            if used >= total_timesteps {
                break;
            }
            let (down, down_steps) = Self::rollout(env, &shifted(-1.0), total_timesteps - used)?;
            used += down_steps;

            let scale = step_size * (up - down) / (2.0 * noise);
            for (row, d) in self.weights.iter_mut().zip(&direction) {
                for (w, d) in row.iter_mut().zip(d) {
                    let mut delta = scale * d;
                    if let Some(limit) = max_update {
                        delta = delta.clamp(-limit, limit);
                    }
                    if delta.is_finite() {
                        *w += delta;
                    }
                }
            }
            updates += 1;
        }

        debug!(variant = %self.variant, updates, timesteps = used, "Random search finished");
        Ok(())
    }

    fn predict(&self, observation: &[f64]) -> Result<Vec<f64>> {
        if !self.is_trained() {
            return Ok(vec![0.0; self.stock_dimension]);
        }
        let expected = self.weights[0].len() - 1;
        if observation.len() != expected {
            return Err(EnsembleError::Agent(format!(
                "observation has {} entries, {} policy expects {expected}",
                observation.len(),
                self.variant
            )));
        }
        Ok(Self::act(&self.weights, observation))
    }

    fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Always predicts zero: the portfolio never trades.
#[derive(Debug, Clone)]
pub struct HoldAgent {
    variant: AgentVariant,
    stock_dimension: usize,
}

impl HoldAgent {
    pub fn new(variant: AgentVariant, stock_dimension: usize) -> Self {
        Self {
            variant,
            stock_dimension,
        }
    }
}

impl Agent for HoldAgent {
    fn variant(&self) -> AgentVariant {
        self.variant
    }

    fn learn(&mut self, _env: &mut dyn Environment, _total_timesteps: u64) -> Result<()> {
        Ok(())
    }

    fn predict(&self, _observation: &[f64]) -> Result<Vec<f64>> {
        Ok(vec![0.0; self.stock_dimension])
    }

    fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::json!({ "variant": self.variant }).to_string())?;
        Ok(())
    }
}

/// Creates [`LinearPolicyAgent`]s (or [`HoldAgent`]s) for the orchestrator.
///
/// Seeds are derived from the base seed, the window and the variant, so a
/// rerun reproduces every window.
#[derive(Debug, Clone)]
pub struct BaselineAgentFactory {
    stock_dimension: usize,
    seed: u64,
    hold: bool,
}

impl BaselineAgentFactory {
    pub fn new(stock_dimension: usize, seed: u64) -> Self {
        Self {
            stock_dimension,
            seed,
            hold: false,
        }
    }

    /// Hand out [`HoldAgent`]s instead of trainable policies.
    pub fn holding(stock_dimension: usize) -> Self {
        Self {
            stock_dimension,
            seed: 0,
            hold: true,
        }
    }

    fn seed_for(&self, variant: AgentVariant, window: usize) -> u64 {
        let variant_index = AgentVariant::ALL
            .iter()
            .position(|v| *v == variant)
            .unwrap_or(0) as u64;
        self.seed
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add((window as u64) << 8)
            .wrapping_add(variant_index)
    }
}

impl AgentFactory for BaselineAgentFactory {
    fn create(&self, variant: AgentVariant, window: usize) -> Result<Box<dyn Agent>> {
        if self.hold {
            return Ok(Box::new(HoldAgent::new(variant, self.stock_dimension)));
        }
        Ok(Box::new(LinearPolicyAgent::new(
            variant,
            self.stock_dimension,
            self.seed_for(variant, window),
        )))
    }
}
