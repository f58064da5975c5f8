use statrs::statistics::Statistics;
use tracing::{info, warn};

use ensemble_core::stats::pct_change;
use ensemble_core::{
    Agent, AgentVariant, EnsembleError, EnvConfig, EnvMode, EnvironmentFactory, MarketDataset,
    Result, TimeWindow, TurbulenceThreshold,
};

use crate::audit::AuditWriter;
use crate::models::EnsembleConfig;

/// Return-series standard deviations at or below this are treated as zero.
pub const MIN_RETURN_STD: f64 = 1e-12;

/// Sharpe-like ratio of an account-value series:
/// `annualization * mean(daily_return) / std(daily_return)`.
///
/// Uses the sample standard deviation. Returns NaN when fewer than two
/// returns exist or the returns have (near) zero variance.
pub fn sharpe_ratio(account_values: &[f64], annualization: f64) -> f64 {
    let returns: Vec<f64> = pct_change(account_values)
        .into_iter()
        .filter(|r| r.is_finite())
        .collect();
    if returns.len() < 2 {
        return f64::NAN;
    }
    let mean = returns.iter().mean();
    let std = returns.iter().std_dev();
    if std.is_nan() || std <= MIN_RETURN_STD {
        return f64::NAN;
    }
    annualization * mean / std
}

/// Validation score of one trained agent.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub variant: AgentVariant,
    pub sharpe: f64,
    pub account_values: Vec<f64>,
}

/// Runs a trained agent over a window's validation slice and scores it.
pub struct ValidationStage<'a> {
    envs: &'a dyn EnvironmentFactory,
    config: &'a EnsembleConfig,
    audit: Option<&'a AuditWriter>,
}

impl<'a> ValidationStage<'a> {
    pub fn new(
        envs: &'a dyn EnvironmentFactory,
        config: &'a EnsembleConfig,
        audit: Option<&'a AuditWriter>,
    ) -> Self {
        Self {
            envs,
            config,
            audit,
        }
    }

    pub fn evaluate(
        &self,
        agent: &dyn Agent,
        dataset: &MarketDataset,
        window: &TimeWindow,
        threshold: TurbulenceThreshold,
    ) -> Result<ValidationResult> {
        let variant = agent.variant();
        let episode = dataset.episode(
            window.validation_start,
            window.validation_end,
            self.config.lookback_dates,
        );
        let steps = episode.scored().len();

        let mut env = self.envs.build(
            episode,
            EnvConfig {
                mode: EnvMode::Validation,
                turbulence_threshold: threshold.value(),
                use_turbulence: threshold.is_enabled(),
                initial: true,
                previous_state: None,
                stock_dimension: self.config.stock_dimension,
                initial_capital: self.config.initial_capital,
                iteration: window.index,
            },
        )?;

        let step_failed = |e: EnsembleError| EnsembleError::EnvironmentStep {
            window: window.index,
            message: format!("{variant} validation: {e}"),
        };

        let mut observation = env.reset().map_err(step_failed)?;
        let mut account_values = Vec::with_capacity(steps + 1);
        account_values.push(env.account_value());
        for _ in 0..steps {
            let action = agent.predict(&observation)?;
            let outcome = env.step(&action).map_err(step_failed)?;
            if outcome.done {
                break;
            }
            account_values.push(outcome.info.account_value);
            observation = outcome.observation;
        }

        let sharpe = sharpe_ratio(&account_values, self.config.annualization_factor);
        info!(
            %variant,
            sharpe,
            from = %window.validation_start,
            to = %window.validation_end,
            "Validation complete"
        );

        if let Some(audit) = self.audit {
            if let Err(e) = audit.write_account_values(window.index, variant, &account_values) {
                warn!(%variant, error = %e, "Failed to write validation account values");
            }
        }

        Ok(ValidationResult {
            variant,
            sharpe,
            account_values,
        })
    }
}
