use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dataset::Episode;
use crate::error::Result;
use crate::types::{AgentVariant, PortfolioState};

/// Which phase of a window an environment is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvMode {
    Train,
    Validation,
    Trade,
}

/// Construction options for a simulation environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    pub mode: EnvMode,
    /// Trading is gated when the day's turbulence reaches this value.
    pub turbulence_threshold: f64,
    pub use_turbulence: bool,
    /// Start from `initial_capital` instead of `previous_state`.
    pub initial: bool,
    pub previous_state: Option<PortfolioState>,
    pub stock_dimension: usize,
    pub initial_capital: f64,
    /// Window index, for artifacts the environment may write.
    pub iteration: usize,
}

/// Per-step diagnostics reported by an environment.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StepInfo {
    /// Cash plus marked-to-market holdings after the step.
    pub account_value: f64,
    pub turbulence: f64,
    /// The turbulence gate was active on this step.
    pub gated: bool,
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub observation: Vec<f64>,
    pub reward: f64,
    pub done: bool,
    pub info: StepInfo,
}

/// Black-box trading simulation.
///
/// An episode over `n` scored days takes `n - 1` trading steps. The step
/// after that finds the episode exhausted, reports `done` and trades nothing.
pub trait Environment: Send {
    fn reset(&mut self) -> Result<Vec<f64>>;

    fn step(&mut self, action: &[f64]) -> Result<StepOutcome>;

    /// Current holdings and cash.
    fn render(&self) -> PortfolioState;

    /// Cash plus marked-to-market holdings at the current day.
    fn account_value(&self) -> f64;

    fn action_dimension(&self) -> usize;
}

/// A trained decision model mapping observations to actions.
pub trait Agent: Send {
    fn variant(&self) -> AgentVariant;

    /// Train in place against `env`. Blocking.
    fn learn(&mut self, env: &mut dyn Environment, total_timesteps: u64) -> Result<()>;

    fn predict(&self, observation: &[f64]) -> Result<Vec<f64>>;

    fn save(&self, path: &Path) -> Result<()>;
}

/// Builds simulation environments over an episode of market data.
pub trait EnvironmentFactory: Send + Sync {
    fn build(&self, episode: Episode, config: EnvConfig) -> Result<Box<dyn Environment>>;
}

/// Creates a fresh, untrained agent for a variant.
pub trait AgentFactory: Send + Sync {
    fn create(&self, variant: AgentVariant, window: usize) -> Result<Box<dyn Agent>>;
}
