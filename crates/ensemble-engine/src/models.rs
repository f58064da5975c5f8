use std::collections::HashSet;
use std::path::PathBuf;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use ensemble_core::{AgentVariant, EnsembleError, Result, Stage};

/// Annualization scalar for the validation Sharpe ratio: sqrt(4), one
/// rebalance per quarter.
pub const QUARTERLY_ANNUALIZATION: f64 = 2.0;

/// Trading dates of lookback history prepended to validation and trading
/// episodes.
///
/// Counted in dates, not dataset rows. A row count would shrink with the
/// number of instruments (80 rows of a 30-stock table is under 3 dates), so
/// the warm-up here is 80 dates regardless of `stock_dimension`.
pub const OLD_PRICES_DIM: usize = 80;

/// Trading dates of turbulence history examined before each window.
pub const TURBULENCE_LOOKBACK: usize = 63;

/// Training budget for one candidate variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantSettings {
    pub variant: AgentVariant,
    pub timesteps: u64,
}

impl VariantSettings {
    pub fn new(variant: AgentVariant, timesteps: u64) -> Self {
        Self { variant, timesteps }
    }

    /// Persisted model name, e.g. `TR_100k_126`.
    pub fn model_name(&self, window: usize) -> String {
        format!("{}_{}k_{}", self.variant.tag(), self.timesteps / 1000, window)
    }
}

/// Configuration for an ensemble walk-forward run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleConfig {
    /// Trading dates between successive windows (also the trade slice length).
    pub rebalance_window: usize,
    /// Trading dates used to score candidates before each trade slice.
    pub validation_window: usize,
    /// Lookback days prepended to validation/trade episodes.
    pub lookback_dates: usize,
    pub turbulence_lookback: usize,
    pub use_turbulence: bool,
    pub stock_dimension: usize,
    pub initial_capital: f64,
    /// First training date. `None` = first dataset date.
    #[serde(default)]
    pub training_start: Option<NaiveDate>,
    pub insample_turbulence_start: NaiveDate,
    /// Exclusive.
    pub insample_turbulence_end: NaiveDate,
    pub annualization_factor: f64,
    pub variants: Vec<VariantSettings>,
    /// Selection order; the first entry wins ties, the last is the fallback.
    pub selection_precedence: Vec<AgentVariant>,
    /// Where CSV/JSON audit artifacts go. `None` disables them.
    #[serde(default)]
    pub results_dir: Option<PathBuf>,
    /// Where trained agents are saved. `None` disables saving.
    #[serde(default)]
    pub trained_model_dir: Option<PathBuf>,
    /// Train and validate the variants of a window on the rayon pool.
    #[serde(default)]
    pub parallel_training: bool,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            rebalance_window: 63,
            validation_window: 63,
            lookback_dates: OLD_PRICES_DIM,
            turbulence_lookback: TURBULENCE_LOOKBACK,
            use_turbulence: false,
            stock_dimension: 1,
            initial_capital: 1_000_000.0,
            training_start: None,
            insample_turbulence_start: NaiveDate::from_ymd_opt(2009, 1, 1).unwrap_or_default(),
            insample_turbulence_end: NaiveDate::from_ymd_opt(2015, 10, 1).unwrap_or_default(),
            annualization_factor: QUARTERLY_ANNUALIZATION,
            variants: vec![
                VariantSettings::new(AgentVariant::PolicyGradient, 10_000),
                VariantSettings::new(AgentVariant::ActorCritic, 30_000),
                VariantSettings::new(AgentVariant::TrustRegion, 100_000),
                VariantSettings::new(AgentVariant::OffPolicy, 10_000),
            ],
            selection_precedence: vec![
                AgentVariant::TrustRegion,
                AgentVariant::ActorCritic,
                AgentVariant::OffPolicy,
                AgentVariant::PolicyGradient,
            ],
            results_dir: None,
            trained_model_dir: None,
            parallel_training: false,
        }
    }
}

impl EnsembleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.rebalance_window == 0 || self.validation_window == 0 {
            return Err(EnsembleError::Configuration(format!(
                "window lengths must be positive (rebalance={}, validation={})",
                self.rebalance_window, self.validation_window
            )));
        }
        if self.stock_dimension == 0 {
            return Err(EnsembleError::Configuration(
                "stock_dimension must be at least 1".to_string(),
            ));
        }
        if self.initial_capital.is_nan() || self.initial_capital <= 0.0 {
            return Err(EnsembleError::Configuration(format!(
                "initial_capital must be positive, got {}",
                self.initial_capital
            )));
        }
        if self.variants.is_empty() {
            return Err(EnsembleError::Configuration(
                "at least one agent variant is required".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for settings in &self.variants {
            if !seen.insert(settings.variant) {
                return Err(EnsembleError::Configuration(format!(
                    "variant {} configured twice",
                    settings.variant
                )));
            }
            if !self.selection_precedence.contains(&settings.variant) {
                return Err(EnsembleError::Configuration(format!(
                    "variant {} missing from selection precedence",
                    settings.variant
                )));
            }
        }
        if self.use_turbulence && self.insample_turbulence_start >= self.insample_turbulence_end {
            return Err(EnsembleError::Configuration(format!(
                "empty in-sample turbulence range {}..{}",
                self.insample_turbulence_start, self.insample_turbulence_end
            )));
        }
        Ok(())
    }
}

/// A window that was abandoned without touching the carried state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedWindow {
    pub window: usize,
    pub stage: String,
    pub reason: String,
}

/// Outcome of [`crate::EnsembleOrchestrator::run`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub windows_scheduled: usize,
    pub windows_completed: usize,
    pub skipped: Vec<SkippedWindow>,
    pub elapsed_minutes: f64,
}

impl RunSummary {
    pub(crate) fn skip(&mut self, window: usize, stage: Stage, reason: String) {
        self.skipped.push(SkippedWindow {
            window,
            stage: stage.to_string(),
            reason,
        });
    }
}
