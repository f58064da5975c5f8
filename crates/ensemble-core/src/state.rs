use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::types::{AgentVariant, PortfolioState, TurbulenceThreshold};

/// What one window contributed to the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowRecord {
    pub window: usize,
    pub validation_start: NaiveDate,
    pub trade_start: NaiveDate,
    pub trade_end: NaiveDate,
    pub turbulence_threshold: TurbulenceThreshold,
    pub chosen: AgentVariant,
    /// Validation Sharpe per variant that trained successfully. NaN marks a
    /// degenerate return series.
    #[serde(with = "nan_as_null")]
    pub sharpe: BTreeMap<AgentVariant, f64>,
    /// Variants whose training failed and were left out of selection.
    #[serde(default)]
    pub failed: Vec<AgentVariant>,
}

/// State threaded from one window to the next.
///
/// Starts empty (no portfolio, which puts the first trading stage in initial
/// mode) and only ever grows by [`EnsembleState::commit`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnsembleState {
    portfolio: Option<PortfolioState>,
    records: Vec<WindowRecord>,
}

impl EnsembleState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Terminal trading state of the last committed window.
    pub fn portfolio(&self) -> Option<&PortfolioState> {
        self.portfolio.as_ref()
    }

    pub fn records(&self) -> &[WindowRecord] {
        &self.records
    }

    pub fn windows_completed(&self) -> usize {
        self.records.len()
    }

    /// Append a finished window and take its trading state as the new seed.
    pub fn commit(&mut self, record: WindowRecord, portfolio: PortfolioState) {
        self.records.push(record);
        self.portfolio = Some(portfolio);
    }

    /// Chosen variant per window, in order.
    pub fn model_use(&self) -> Vec<AgentVariant> {
        self.records.iter().map(|r| r.chosen).collect()
    }

    /// Validation Sharpe of `variant` per window it was scored in.
    pub fn sharpe_history(&self, variant: AgentVariant) -> Vec<f64> {
        self.records
            .iter()
            .filter_map(|r| r.sharpe.get(&variant).copied())
            .collect()
    }

    /// How many windows each variant traded.
    pub fn usage_counts(&self) -> BTreeMap<AgentVariant, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            *counts.entry(record.chosen).or_insert(0) += 1;
        }
        counts
    }
}

/// JSON has no NaN; store undefined metrics as `null`.
mod nan_as_null {
    use super::*;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<AgentVariant, f64>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let out: BTreeMap<AgentVariant, Option<f64>> = map
            .iter()
            .map(|(k, v)| (*k, if v.is_finite() { Some(*v) } else { None }))
            .collect();
        out.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<AgentVariant, f64>, D::Error> {
        let raw: BTreeMap<AgentVariant, Option<f64>> = BTreeMap::deserialize(deserializer)?;
        Ok(raw
            .into_iter()
            .map(|(k, v)| (k, v.unwrap_or(f64::NAN)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(window: usize, chosen: AgentVariant, sharpe: &[(AgentVariant, f64)]) -> WindowRecord {
        let d = NaiveDate::from_ymd_opt(2016, 1, 4).unwrap();
        WindowRecord {
            window,
            validation_start: d,
            trade_start: d,
            trade_end: d,
            turbulence_threshold: TurbulenceThreshold::Disabled,
            chosen,
            sharpe: sharpe.iter().copied().collect(),
            failed: Vec::new(),
        }
    }

    #[test]
    fn test_new_state_is_initial() {
        let state = EnsembleState::new();
        assert!(state.portfolio().is_none());
        assert_eq!(state.windows_completed(), 0);
    }

    #[test]
    fn test_commit_appends_and_replaces_portfolio() {
        let mut state = EnsembleState::new();
        state.commit(
            record(126, AgentVariant::TrustRegion, &[(AgentVariant::TrustRegion, 1.2)]),
            PortfolioState::from_vec(vec![10.0, 1.0]),
        );
        state.commit(
            record(189, AgentVariant::ActorCritic, &[(AgentVariant::ActorCritic, 0.4)]),
            PortfolioState::from_vec(vec![20.0, 0.0]),
        );
        assert_eq!(state.windows_completed(), 2);
        assert_eq!(state.portfolio().unwrap().as_slice(), &[20.0, 0.0]);
        assert_eq!(
            state.model_use(),
            vec![AgentVariant::TrustRegion, AgentVariant::ActorCritic]
        );
        assert_eq!(state.usage_counts()[&AgentVariant::ActorCritic], 1);
    }

    #[test]
    fn test_sharpe_history_skips_missing_windows() {
        let mut state = EnsembleState::new();
        state.commit(
            record(
                1,
                AgentVariant::OffPolicy,
                &[(AgentVariant::OffPolicy, 0.5), (AgentVariant::PolicyGradient, 0.1)],
            ),
            PortfolioState::from_vec(vec![1.0, 0.0]),
        );
        state.commit(
            record(2, AgentVariant::OffPolicy, &[(AgentVariant::OffPolicy, 0.7)]),
            PortfolioState::from_vec(vec![1.0, 0.0]),
        );
        assert_eq!(state.sharpe_history(AgentVariant::OffPolicy), vec![0.5, 0.7]);
        assert_eq!(state.sharpe_history(AgentVariant::PolicyGradient), vec![0.1]);
    }

    #[test]
    fn test_nan_sharpe_survives_json() {
        let mut state = EnsembleState::new();
        state.commit(
            record(
                1,
                AgentVariant::TrustRegion,
                &[(AgentVariant::TrustRegion, f64::NAN), (AgentVariant::ActorCritic, 0.3)],
            ),
            PortfolioState::from_vec(vec![5.0, 2.0]),
        );
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("null"));

        let back: EnsembleState = serde_json::from_str(&json).unwrap();
        let sharpe = &back.records()[0].sharpe;
        assert!(sharpe[&AgentVariant::TrustRegion].is_nan());
        assert_eq!(sharpe[&AgentVariant::ActorCritic], 0.3);
        assert_eq!(back.portfolio().unwrap().as_slice(), &[5.0, 2.0]);
    }
}
