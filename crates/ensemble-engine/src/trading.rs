use tracing::{info, warn};

use ensemble_core::{
    Agent, EnsembleError, EnvConfig, EnvMode, EnvironmentFactory, MarketDataset, PortfolioState,
    Result, TimeWindow, TurbulenceThreshold,
};

use crate::audit::AuditWriter;
use crate::models::EnsembleConfig;

/// Name under which the carried trading state is persisted.
pub const ENSEMBLE_STATE_NAME: &str = "ensemble";

/// Runs the selected agent over a window's trade slice and returns the
/// portfolio state that seeds the next window.
pub struct TradingStage<'a> {
    envs: &'a dyn EnvironmentFactory,
    config: &'a EnsembleConfig,
    audit: Option<&'a AuditWriter>,
}

impl<'a> TradingStage<'a> {
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

    /// `prior` is ignored when `is_initial` is set; otherwise it is required
    /// and must match the configured stock dimension.
    ///
    /// The returned state is the environment's render after the
    /// second-to-last step, not the last one. Earlier backtests carried that
    /// snapshot forward and this keeps their results reproducible; change it
    /// only with the strategy owners' agreement.
    pub fn trade(
        &self,
        dataset: &MarketDataset,
        agent: &dyn Agent,
        prior: Option<&PortfolioState>,
        window: &TimeWindow,
        threshold: TurbulenceThreshold,
        is_initial: bool,
    ) -> Result<PortfolioState> {
        let stock_dimension = self.config.stock_dimension;
        let previous_state = if is_initial {
            None
        } else {
            let state = prior.ok_or_else(|| {
                EnsembleError::DataIntegrity(format!(
                    "window {} is not initial but no portfolio state was carried",
                    window.index
                ))
            })?;
            state.check_shape(stock_dimension)?;
            Some(state.clone())
        };

        info!(
            from = %window.trade_start,
            to = %window.trade_end,
            variant = %agent.variant(),
            "Trading"
        );

        let episode = dataset.episode(
            window.trade_start,
            window.trade_end,
            self.config.lookback_dates,
        );
        let steps = episode.scored().len();

        let mut env = self.envs.build(
            episode,
            EnvConfig {
                mode: EnvMode::Trade,
                turbulence_threshold: threshold.value(),
                use_turbulence: threshold.is_enabled(),
                initial: is_initial,
                previous_state: previous_state.clone(),
                stock_dimension,
                initial_capital: self.config.initial_capital,
                iteration: window.index,
            },
        )?;

        let step_failed = |e: EnsembleError| EnsembleError::EnvironmentStep {
            window: window.index,
            message: format!("trading: {e}"),
        };

        let mut observation = env.reset().map_err(step_failed)?;
        // Fewer than two trade dates never reach the capture step; the seed
        // state is carried through unchanged.
        let mut last_state = previous_state.unwrap_or_else(|| env.render());
        for i in 0..steps {
            let action = agent.predict(&observation)?;
            let outcome = env.step(&action).map_err(step_failed)?;
            observation = outcome.observation;
            if i + 2 == steps {
                last_state = env.render();
            }
        }

        last_state.check_shape(stock_dimension)?;

        if let Some(audit) = self.audit {
            if let Err(e) = audit.write_last_state(ENSEMBLE_STATE_NAME, window.index, &last_state) {
                warn!(error = %e, "Failed to write last trading state");
            }
        }

        Ok(last_state)
    }
}
