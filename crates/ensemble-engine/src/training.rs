use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

use rayon::prelude::*;
use tracing::{info, warn};

use ensemble_core::{
    Agent, AgentFactory, AgentVariant, EnsembleError, EnvConfig, EnvMode, EnvironmentFactory,
    MarketDataset, Result, TimeWindow,
};

use crate::cancel::CancellationToken;
use crate::models::{EnsembleConfig, VariantSettings};

/// A freshly trained agent, owned by the window that produced it.
pub struct TrainedAgent {
    pub variant: AgentVariant,
    pub name: String,
    pub agent: Box<dyn Agent>,
}

/// Agents that trained, plus the variants that did not.
#[derive(Default)]
pub struct TrainingOutcome {
    pub trained: Vec<TrainedAgent>,
    pub failed: Vec<(AgentVariant, EnsembleError)>,
}

/// Trains every configured variant on a window's training slice.
pub struct TrainingStage<'a> {
    agents: &'a dyn AgentFactory,
    envs: &'a dyn EnvironmentFactory,
    config: &'a EnsembleConfig,
}

impl<'a> TrainingStage<'a> {
    pub fn new(
        agents: &'a dyn AgentFactory,
        envs: &'a dyn EnvironmentFactory,
        config: &'a EnsembleConfig,
    ) -> Self {
        Self {
            agents,
            envs,
            config,
        }
    }

    /// Train all variants. A variant that fails lands in `failed`; only
    /// cancellation aborts the stage.
    pub fn train_all(
        &self,
        dataset: &MarketDataset,
        window: &TimeWindow,
        cancel: &CancellationToken,
    ) -> Result<TrainingOutcome> {
        info!(
            from = %window.train_start,
            to = %window.validation_start,
            "Model training"
        );

        let results: Vec<(AgentVariant, Option<Result<TrainedAgent>>)> =
            if self.config.parallel_training {
                self.config
                    .variants
                    .par_iter()
                    .map(|settings| {
                        if cancel.is_cancelled() {
                            return (settings.variant, None);
                        }
                        (settings.variant, Some(self.train(settings, dataset, window)))
                    })
                    .collect()
            } else {
                let mut results = Vec::with_capacity(self.config.variants.len());
                for settings in &self.config.variants {
                    if cancel.is_cancelled() {
                        return Err(EnsembleError::Cancelled {
                            window: window.index,
                        });
                    }
                    results.push((settings.variant, Some(self.train(settings, dataset, window))));
                }
                results
            };

        let mut outcome = TrainingOutcome::default();
        for (variant, result) in results {
            match result {
                None => {
                    return Err(EnsembleError::Cancelled {
                        window: window.index,
                    })
                }
                Some(Ok(trained)) => outcome.trained.push(trained),
                Some(Err(e)) => {
                    warn!(%variant, error = %e, "Training failed; variant excluded from selection");
                    outcome.failed.push((variant, e));
                }
            }
        }
        Ok(outcome)
    }

    /// Train a single variant. Any error or panic from the agent is reported
    /// as a [`EnsembleError::TrainingFailure`].
    pub fn train(
        &self,
        settings: &VariantSettings,
        dataset: &MarketDataset,
        window: &TimeWindow,
    ) -> Result<TrainedAgent> {
        let variant = settings.variant;
        let failure = |message: String| EnsembleError::TrainingFailure {
            variant,
            window: window.index,
            message,
        };

        let started = Instant::now();
        let mut agent = self
            .agents
            .create(variant, window.index)
            .map_err(|e| failure(e.to_string()))?;

        let episode = dataset.episode(window.train_start, window.validation_start, 0);
        if episode.days.is_empty() {
            warn!(%variant, "Empty training slice; agent left untrained");
        } else {
            let mut env = self
                .envs
                .build(
                    episode,
                    EnvConfig {
                        mode: EnvMode::Train,
                        turbulence_threshold: 0.0,
                        use_turbulence: false,
                        initial: true,
                        previous_state: None,
                        stock_dimension: self.config.stock_dimension,
                        initial_capital: self.config.initial_capital,
                        iteration: window.index,
                    },
                )
                .map_err(|e| failure(e.to_string()))?;

            let learned = catch_unwind(AssertUnwindSafe(|| {
                agent.learn(env.as_mut(), settings.timesteps)
            }));
            match learned {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(failure(e.to_string())),
                Err(_) => return Err(failure("agent panicked during learn".to_string())),
            }
        }

        let name = settings.model_name(window.index);
        if let Some(dir) = &self.config.trained_model_dir {
            let path = dir.join(&name);
            let saved = std::fs::create_dir_all(dir)
                .map_err(EnsembleError::from)
                .and_then(|_| agent.save(&path));
            if let Err(e) = saved {
                warn!(%variant, path = %path.display(), error = %e, "Failed to save trained agent");
            }
        }

        info!(
            %variant,
            model = %name,
            minutes = started.elapsed().as_secs_f64() / 60.0,
            "Training complete"
        );

        Ok(TrainedAgent {
            variant,
            name,
            agent,
        })
    }
}
