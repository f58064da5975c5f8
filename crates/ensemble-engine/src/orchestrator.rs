use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use rayon::prelude::*;
use tracing::{error, info, info_span, warn};

use ensemble_core::{
    AgentFactory, AgentVariant, EnsembleError, EnsembleState, EnvironmentFactory, MarketDataset,
    PortfolioState, Result, Stage, TimeWindow, WindowRecord,
};

use crate::audit::AuditWriter;
use crate::cancel::CancellationToken;
use crate::models::{EnsembleConfig, RunSummary};
use crate::scheduler::WindowScheduler;
use crate::selection::ModelSelector;
use crate::trading::TradingStage;
use crate::training::{TrainedAgent, TrainingStage};
use crate::turbulence::TurbulenceController;
use crate::validation::{ValidationResult, ValidationStage};

/// Drives the walk-forward loop: for every window it sets the turbulence
/// gate, trains and validates each variant, selects one and trades with it,
/// then commits the result to the [`EnsembleState`].
///
/// Windows run strictly in order. A failure confined to one window (every
/// variant failing to train, an environment rejecting a step) skips that
/// window and leaves the state as of the last committed window. Bookkeeping
/// failures (dataset shape, carried state shape) abort the run.
pub struct EnsembleOrchestrator {
    config: EnsembleConfig,
    agents: Arc<dyn AgentFactory>,
    envs: Arc<dyn EnvironmentFactory>,
    selector: ModelSelector,
    audit: Option<AuditWriter>,
    cancel: CancellationToken,
}

impl EnsembleOrchestrator {
    pub fn new(
        config: EnsembleConfig,
        agents: Arc<dyn AgentFactory>,
        envs: Arc<dyn EnvironmentFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let audit = config
            .results_dir
            .as_ref()
            .map(AuditWriter::new)
            .transpose()?;
        let selector = ModelSelector::new(config.selection_precedence.clone());
        Ok(Self {
            config,
            agents,
            envs,
            selector,
            audit,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    /// Run every window of `calendar` against `dataset`, committing each
    /// completed window to `state`.
    ///
    /// On error `state` still holds every window committed before it.
    pub fn run(
        &self,
        dataset: &MarketDataset,
        calendar: &[NaiveDate],
        state: &mut EnsembleState,
    ) -> Result<RunSummary> {
        let started = Instant::now();
        info!("============ Start Ensemble Strategy ============");

        if dataset.stock_dimension() != self.config.stock_dimension {
            return Err(EnsembleError::DataIntegrity(format!(
                "dataset has {} instruments per date but stock_dimension is {}",
                dataset.stock_dimension(),
                self.config.stock_dimension
            )));
        }

        let turbulence = TurbulenceController::new(&self.config, dataset)?;
        let train_start = self.config.training_start.unwrap_or_else(|| dataset.first_date());
        let scheduler = WindowScheduler::new(
            calendar,
            train_start,
            self.config.rebalance_window,
            self.config.validation_window,
        )?;

        let mut summary = RunSummary {
            windows_scheduled: scheduler.window_count(),
            ..Default::default()
        };
        if summary.windows_scheduled == 0 {
            warn!(
                dates = calendar.len(),
                rebalance_window = self.config.rebalance_window,
                validation_window = self.config.validation_window,
                "Trade calendar too short for a single window; nothing to do"
            );
            return Ok(summary);
        }

        for window in scheduler.windows() {
            if self.cancel.is_cancelled() {
                warn!(window = window.index, "Run cancelled at window boundary");
                return Err(EnsembleError::Cancelled {
                    window: window.index,
                });
            }

            let span = info_span!("window", index = window.index, ordinal = window.ordinal);
            let _enter = span.enter();
            info!("============================================");

            match self.run_window(dataset, &turbulence, &window, state.portfolio()) {
                Ok((record, next_state)) => {
                    info!(chosen = %record.chosen, "Window committed");
                    state.commit(record, next_state);
                    summary.windows_completed += 1;
                    self.persist(state);
                }
                Err((stage, e)) if is_window_local(&e) => {
                    error!(%stage, error = %e, "Window skipped; carried state unchanged");
                    summary.skip(window.index, stage, e.to_string());
                }
                Err((stage, e)) => return Err(e.in_window(window.index, stage)),
            }
        }

        summary.elapsed_minutes = started.elapsed().as_secs_f64() / 60.0;
        info!(
            minutes = summary.elapsed_minutes,
            completed = summary.windows_completed,
            skipped = summary.skipped.len(),
            "Ensemble Strategy finished"
        );
        Ok(summary)
    }

    fn run_window(
        &self,
        dataset: &MarketDataset,
        turbulence: &TurbulenceController,
        window: &TimeWindow,
        prior: Option<&PortfolioState>,
    ) -> std::result::Result<(WindowRecord, PortfolioState), (Stage, EnsembleError)> {
        let threshold = turbulence.threshold_for(dataset, window);
        if threshold.is_enabled() {
            info!(threshold = threshold.value(), "Turbulence threshold");
        }

        let training = TrainingStage::new(self.agents.as_ref(), self.envs.as_ref(), &self.config)
            .train_all(dataset, window, &self.cancel)
            .map_err(|e| (Stage::Training, e))?;
        let failed: Vec<AgentVariant> = training.failed.iter().map(|(v, _)| *v).collect();
        let mut trained = training.trained;
        if trained.is_empty() {
            return Err((
                Stage::Training,
                EnsembleError::NoCandidates {
                    window: window.index,
                },
            ));
        }

        let validation = ValidationStage::new(self.envs.as_ref(), &self.config, self.audit.as_ref());
        let scores: Vec<Result<ValidationResult>> = if self.config.parallel_training {
            trained
                .par_iter_mut()
                .map(|t| validation.evaluate(t.agent.as_ref(), dataset, window, threshold))
                .collect()
        } else {
            trained
                .iter()
                .map(|t| validation.evaluate(t.agent.as_ref(), dataset, window, threshold))
                .collect()
        };
        let mut sharpe = BTreeMap::new();
        for score in scores {
            let score = score.map_err(|e| (Stage::Validation, e))?;
            sharpe.insert(score.variant, score.sharpe);
        }

        let chosen = self.selector.select(&sharpe).ok_or((
            Stage::Selection,
            EnsembleError::NoCandidates {
                window: window.index,
            },
        ))?;
        let selected: &TrainedAgent = trained
            .iter()
            .find(|t| t.variant == chosen)
            .ok_or((
                Stage::Selection,
                EnsembleError::NoCandidates {
                    window: window.index,
                },
            ))?;
        info!(%chosen, model = %selected.name, sharpe = sharpe[&chosen], "Model selected");

        // A skipped first window leaves nothing to carry, so trade from
        // initial capital until a window commits.
        let is_initial = window.is_initial || prior.is_none();
        let next_state = TradingStage::new(self.envs.as_ref(), &self.config, self.audit.as_ref())
            .trade(
                dataset,
                selected.agent.as_ref(),
                prior,
                window,
                threshold,
                is_initial,
            )
            .map_err(|e| (Stage::Trading, e))?;

        let record = WindowRecord {
            window: window.index,
            validation_start: window.validation_start,
            trade_start: window.trade_start,
            trade_end: window.trade_end,
            turbulence_threshold: threshold,
            chosen,
            sharpe,
            failed,
        };
        Ok((record, next_state))
    }

    fn persist(&self, state: &EnsembleState) {
        if let Some(audit) = &self.audit {
            let variants: Vec<AgentVariant> =
                self.config.variants.iter().map(|s| s.variant).collect();
            if let Err(e) = audit.write_state(state, &variants) {
                warn!(error = %e, "Failed to persist ensemble state");
            }
        }
    }
}

/// Errors that invalidate a single window but not the run.
fn is_window_local(e: &EnsembleError) -> bool {
    matches!(
        e,
        EnsembleError::EnvironmentStep { .. }
            | EnsembleError::NoCandidates { .. }
            | EnsembleError::TrainingFailure { .. }
            | EnsembleError::Agent(_)
    )
}
