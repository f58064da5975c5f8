use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{EnsembleError, Result};

/// Candidate agent families trained in every window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentVariant {
    PolicyGradient,
    ActorCritic,
    OffPolicy,
    TrustRegion,
}

impl AgentVariant {
    /// All variants in training order.
    pub const ALL: [AgentVariant; 4] = [
        AgentVariant::PolicyGradient,
        AgentVariant::ActorCritic,
        AgentVariant::OffPolicy,
        AgentVariant::TrustRegion,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AgentVariant::PolicyGradient => "policy_gradient",
            AgentVariant::ActorCritic => "actor_critic",
            AgentVariant::OffPolicy => "off_policy",
            AgentVariant::TrustRegion => "trust_region",
        }
    }

    /// Short upper-case tag used in persisted model names.
    pub fn tag(&self) -> &'static str {
        match self {
            AgentVariant::PolicyGradient => "PG",
            AgentVariant::ActorCritic => "AC",
            AgentVariant::OffPolicy => "OP",
            AgentVariant::TrustRegion => "TR",
        }
    }
}

impl fmt::Display for AgentVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Flat portfolio snapshot carried between windows: `[cash, holdings..]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortfolioState(Vec<f64>);

impl PortfolioState {
    /// Starting state: all capital in cash, no holdings.
    pub fn initial(capital: f64, stock_dimension: usize) -> Self {
        let mut values = vec![0.0; stock_dimension + 1];
        values[0] = capital;
        Self(values)
    }

    pub fn from_vec(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn cash(&self) -> f64 {
        self.0.first().copied().unwrap_or(0.0)
    }

    pub fn holdings(&self) -> &[f64] {
        self.0.get(1..).unwrap_or(&[])
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The vector must hold one cash slot plus one holding per instrument.
    pub fn check_shape(&self, stock_dimension: usize) -> Result<()> {
        let expected = stock_dimension + 1;
        if self.0.len() != expected {
            return Err(EnsembleError::StateShape {
                expected,
                actual: self.0.len(),
            });
        }
        Ok(())
    }
}

/// All observations for one trading date, instruments in ticker order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingDay {
    pub date: NaiveDate,
    pub prices: Vec<f64>,
    /// Per-instrument feature vectors, same order as `prices`.
    pub features: Vec<Vec<f64>>,
    /// Market-wide turbulence signal for the date.
    pub turbulence: f64,
}

/// One (train, validate, trade) iteration over the trade calendar.
///
/// Ranges are half-open: training covers `[train_start, validation_start)`,
/// validation `[validation_start, validation_end)` and trading
/// `[trade_start, trade_end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Position of `trade_end` in the trade calendar. Used to name artifacts.
    pub index: usize,
    /// Zero-based count of windows emitted before this one.
    pub ordinal: usize,
    pub train_start: NaiveDate,
    pub validation_start: NaiveDate,
    pub validation_end: NaiveDate,
    pub trade_start: NaiveDate,
    pub trade_end: NaiveDate,
    pub is_initial: bool,
}

/// Risk gate handed to validation and trading environments.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TurbulenceThreshold {
    /// Gating switched off; environments ignore the value.
    Disabled,
    /// In-sample 90th percentile.
    Baseline(f64),
    /// In-sample maximum: the gate effectively never trips.
    Relaxed(f64),
}

impl TurbulenceThreshold {
    pub fn value(&self) -> f64 {
        match self {
            TurbulenceThreshold::Disabled => 0.0,
            TurbulenceThreshold::Baseline(v) | TurbulenceThreshold::Relaxed(v) => *v,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, TurbulenceThreshold::Disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_portfolio_state() {
        let state = PortfolioState::initial(1_000_000.0, 3);
        assert_eq!(state.as_slice(), &[1_000_000.0, 0.0, 0.0, 0.0]);
        assert_eq!(state.cash(), 1_000_000.0);
        assert_eq!(state.holdings(), &[0.0, 0.0, 0.0]);
        assert!(state.check_shape(3).is_ok());
    }

    #[test]
    fn test_state_shape_mismatch() {
        let state = PortfolioState::from_vec(vec![10.0, 1.0]);
        match state.check_shape(2) {
            Err(EnsembleError::StateShape { expected, actual }) => {
                assert_eq!(expected, 3);
                assert_eq!(actual, 2);
            }
            other => panic!("expected shape error, got {other:?}"),
        }
    }

    #[test]
    fn test_disabled_threshold_is_neutral() {
        assert_eq!(TurbulenceThreshold::Disabled.value(), 0.0);
        assert!(!TurbulenceThreshold::Disabled.is_enabled());
        assert_eq!(TurbulenceThreshold::Relaxed(212.5).value(), 212.5);
    }

    #[test]
    fn test_variant_serde_names() {
        let json = serde_json::to_string(&AgentVariant::TrustRegion).unwrap();
        assert_eq!(json, "\"trust_region\"");
        assert_eq!(AgentVariant::ActorCritic.to_string(), "actor_critic");
    }
}
