use tracing::{debug, info};

use ensemble_core::stats::{mean, quantile};
use ensemble_core::{EnsembleError, MarketDataset, Result, TimeWindow, TurbulenceThreshold};

use crate::models::EnsembleConfig;

/// In-sample turbulence statistics, computed once per run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TurbulenceBaseline {
    /// 90th percentile of in-sample turbulence.
    pub p90: f64,
    /// 100th percentile (maximum).
    pub max: f64,
}

/// Per-window turbulence gate.
///
/// When the mean turbulence over the lookback before a window stays at or
/// below the in-sample 90th percentile, that percentile is the gate. When it
/// exceeds it, the gate is raised to the in-sample maximum so trading is not
/// halted through an already turbulent regime.
#[derive(Debug, Clone)]
pub struct TurbulenceController {
    baseline: Option<TurbulenceBaseline>,
    lookback: usize,
}

impl TurbulenceController {
    pub fn disabled() -> Self {
        Self {
            baseline: None,
            lookback: 0,
        }
    }

    pub fn new(config: &EnsembleConfig, dataset: &MarketDataset) -> Result<Self> {
        if !config.use_turbulence {
            return Ok(Self::disabled());
        }

        let insample = dataset.turbulence_between(
            config.insample_turbulence_start,
            config.insample_turbulence_end,
        );
        let (p90, max) = match (quantile(&insample, 0.90), quantile(&insample, 1.0)) {
            (Some(p90), Some(max)) => (p90, max),
            _ => {
                return Err(EnsembleError::Configuration(format!(
                    "no turbulence data in the in-sample range {}..{}",
                    config.insample_turbulence_start, config.insample_turbulence_end
                )))
            }
        };
        info!(
            p90,
            max,
            dates = insample.len(),
            "In-sample turbulence baseline computed"
        );

        Ok(Self {
            baseline: Some(TurbulenceBaseline { p90, max }),
            lookback: config.turbulence_lookback,
        })
    }

    pub fn baseline(&self) -> Option<TurbulenceBaseline> {
        self.baseline
    }

    pub fn threshold_for(&self, dataset: &MarketDataset, window: &TimeWindow) -> TurbulenceThreshold {
        let Some(baseline) = self.baseline else {
            return TurbulenceThreshold::Disabled;
        };

        let end = dataset.position(window.validation_start);
        let start = end.saturating_sub(self.lookback);
        let recent: Vec<f64> = dataset.days()[start..end]
            .iter()
            .map(|d| d.turbulence)
            .collect();
        let recent_mean = mean(&recent);
        debug!(recent_mean, dates = recent.len(), "Historical turbulence");

        // An empty lookback has an undefined mean, which never exceeds the baseline.
        if recent_mean > baseline.p90 {
            TurbulenceThreshold::Relaxed(baseline.max)
        } else {
            TurbulenceThreshold::Baseline(baseline.p90)
        }
    }
}
