use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use ensemble_core::AgentVariant;
use ensemble_engine::{EnsembleConfig, VariantSettings};

use crate::data::parse_date;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    // Input data
    pub data_file: PathBuf,
    pub stock_dimension: usize,

    // Trade calendar: (start, end]
    pub trade_calendar_start: NaiveDate,
    pub trade_calendar_end: NaiveDate,

    // Windows
    pub rebalance_window: usize,
    pub validation_window: usize,

    // Turbulence
    pub use_turbulence: bool,

    // Capital and agents
    pub initial_capital: f64,
    pub timesteps: Vec<(AgentVariant, u64)>,
    pub agent_seed: u64,
    pub parallel_training: bool,

    // Output
    pub results_dir: PathBuf,
    pub trained_model_dir: PathBuf,
}

impl RunnerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; missing keys take the defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let mut timesteps = Vec::with_capacity(AgentVariant::ALL.len());
        for (variant, default) in [
            (AgentVariant::PolicyGradient, "10000"),
            (AgentVariant::ActorCritic, "30000"),
            (AgentVariant::TrustRegion, "100000"),
            (AgentVariant::OffPolicy, "10000"),
        ] {
            let key = format!("TIMESTEPS_{}", variant.name().to_uppercase());
            let steps = var(&key, default)
                .parse()
                .with_context(|| format!("{key} must be an integer"))?;
            timesteps.push((variant, steps));
        }

        let config = Self {
            data_file: PathBuf::from(var("DATA_FILE", "data/dow_30_2009_2020.csv")),
            stock_dimension: var("STOCK_DIMENSION", "30")
                .parse()
                .context("STOCK_DIMENSION must be an integer")?,

            trade_calendar_start: parse_date(&var("TRADE_CALENDAR_START", "20151001"))
                .context("TRADE_CALENDAR_START must be YYYYMMDD or YYYY-MM-DD")?,
            trade_calendar_end: parse_date(&var("TRADE_CALENDAR_END", "20200707"))
                .context("TRADE_CALENDAR_END must be YYYYMMDD or YYYY-MM-DD")?,

            rebalance_window: var("REBALANCE_WINDOW", "63")
                .parse()
                .context("REBALANCE_WINDOW must be an integer")?,
            validation_window: var("VALIDATION_WINDOW", "63")
                .parse()
                .context("VALIDATION_WINDOW must be an integer")?,

            use_turbulence: var("USE_TURBULENCE", "true")
                .parse()
                .context("USE_TURBULENCE must be true or false")?,

            initial_capital: var("INITIAL_CAPITAL", "1000000")
                .parse()
                .context("INITIAL_CAPITAL must be a number")?,
            timesteps,
            agent_seed: var("AGENT_SEED", "42")
                .parse()
                .context("AGENT_SEED must be an integer")?,
            parallel_training: var("PARALLEL_TRAINING", "false")
                .parse()
                .context("PARALLEL_TRAINING must be true or false")?,

            results_dir: PathBuf::from(var("RESULTS_DIR", "results")),
            trained_model_dir: PathBuf::from(var("TRAINED_MODEL_DIR", "trained_models")),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.trade_calendar_start >= self.trade_calendar_end {
            anyhow::bail!(
                "TRADE_CALENDAR_START ({}) must be before TRADE_CALENDAR_END ({})",
                self.trade_calendar_start,
                self.trade_calendar_end
            );
        }
        self.ensemble_config()
            .validate()
            .context("invalid ensemble configuration")?;
        Ok(())
    }

    pub fn ensemble_config(&self) -> EnsembleConfig {
        EnsembleConfig {
            rebalance_window: self.rebalance_window,
            validation_window: self.validation_window,
            use_turbulence: self.use_turbulence,
            stock_dimension: self.stock_dimension,
            initial_capital: self.initial_capital,
            variants: self
                .timesteps
                .iter()
                .map(|(v, t)| VariantSettings::new(*v, *t))
                .collect(),
            results_dir: Some(self.results_dir.clone()),
            trained_model_dir: Some(self.trained_model_dir.clone()),
            parallel_training: self.parallel_training,
            ..Default::default()
        }
    }
}
