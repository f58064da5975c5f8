use std::fs;
use std::path::{Path, PathBuf};

use ensemble_core::{AgentVariant, EnsembleError, EnsembleState, PortfolioState, Result};

/// Writes run artifacts under a results directory.
///
/// Nothing here feeds back into the run: metrics and states are computed in
/// memory and these files are only an audit trail.
///
/// File names carry more than the bare window index. Validation curves are
/// written per variant as `account_value_validation_{window}_{variant}.csv`
/// rather than one `account_value_validation_{window}.csv`, which every
/// variant would overwrite. The captured trading state is keyed by window
/// index, not step index: `last_state_{name}_{window}.csv`.
#[derive(Debug, Clone)]
pub struct AuditWriter {
    dir: PathBuf,
}

impl AuditWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `account_value_validation_{window}_{variant}.csv`
    pub fn write_account_values(
        &self,
        window: usize,
        variant: AgentVariant,
        values: &[f64],
    ) -> Result<PathBuf> {
        let path = self
            .dir
            .join(format!("account_value_validation_{window}_{variant}.csv"));
        write_single_column(&path, "account_value", values)?;
        Ok(path)
    }

    /// `last_state_{name}_{window}.csv`
    pub fn write_last_state(
        &self,
        name: &str,
        window: usize,
        state: &PortfolioState,
    ) -> Result<PathBuf> {
        let path = self.dir.join(format!("last_state_{name}_{window}.csv"));
        write_single_column(&path, "last_state", state.as_slice())?;
        Ok(path)
    }

    /// Full state as JSON plus a one-row-per-window selection table.
    pub fn write_state(&self, state: &EnsembleState, variants: &[AgentVariant]) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        fs::write(self.dir.join("ensemble_state.json"), json)?;

        let mut writer = csv::Writer::from_path(self.dir.join("model_selection.csv"))?;
        let mut header = vec![
            "window".to_string(),
            "validation_start".to_string(),
            "trade_start".to_string(),
            "trade_end".to_string(),
            "turbulence_threshold".to_string(),
            "chosen".to_string(),
        ];
        header.extend(variants.iter().map(|v| format!("{v}_sharpe")));
        writer.write_record(&header)?;

        for record in state.records() {
            let mut row = vec![
                record.window.to_string(),
                record.validation_start.to_string(),
                record.trade_start.to_string(),
                record.trade_end.to_string(),
                record.turbulence_threshold.value().to_string(),
                record.chosen.to_string(),
            ];
            row.extend(variants.iter().map(|v| {
                record
                    .sharpe
                    .get(v)
                    .map(|s| s.to_string())
                    .unwrap_or_default()
            }));
            writer.write_record(&row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn write_single_column(path: &Path, header: &str, values: &[f64]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record([header])?;
    for v in values {
        writer.write_record([v.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

/// Read back a single-column artifact written by this module. A cell that is
/// not a number is a [`EnsembleError::DataIntegrity`] error.
pub fn read_single_column(path: &Path) -> Result<Vec<f64>> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
    let mut values = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record?;
        let raw = record.get(0).unwrap_or("").trim();
        let value = raw.parse::<f64>().map_err(|e| {
            EnsembleError::DataIntegrity(format!(
                "{} line {}: '{raw}' is not a number: {e}",
                path.display(),
                i + 2
            ))
        })?;
        values.push(value);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ensemble_core::{TurbulenceThreshold, WindowRecord};

    #[test]
    fn test_last_state_file_format() {
        let tmp = tempfile::tempdir().unwrap();
        let audit = AuditWriter::new(tmp.path()).unwrap();
        let state = PortfolioState::from_vec(vec![1000.5, 3.0, 0.0]);
        let path = audit.write_last_state("ensemble", 126, &state).unwrap();

        assert!(path.ends_with("last_state_ensemble_126.csv"));
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "last_state\n1000.5\n3\n0\n");
        assert_eq!(read_single_column(&path).unwrap(), vec![1000.5, 3.0, 0.0]);
    }

    #[test]
    fn test_account_values_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let audit = AuditWriter::new(tmp.path().join("results")).unwrap();
        let values = [1_000_000.0, 1_000_250.25, 999_800.0];
        let path = audit
            .write_account_values(189, AgentVariant::OffPolicy, &values)
            .unwrap();
        assert!(path.ends_with("account_value_validation_189_off_policy.csv"));
        assert_eq!(read_single_column(&path).unwrap(), values.to_vec());
    }

    #[test]
    fn test_corrupt_cell_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("last_state_ensemble_63.csv");
        fs::write(&path, "last_state\n1000.5\nabc\n").unwrap();

        match read_single_column(&path) {
            Err(EnsembleError::DataIntegrity(msg)) => assert!(msg.contains("line 3")),
            other => panic!("expected data integrity error, got {other:?}"),
        }
    }

    #[test]
    fn test_state_json_reloads_exact_floats() {
        let tmp = tempfile::tempdir().unwrap();
        let audit = AuditWriter::new(tmp.path()).unwrap();
        let d = NaiveDate::from_ymd_opt(2016, 1, 4).unwrap();
        let portfolio =
            PortfolioState::from_vec(vec![986_672.140_712_752_5, 0.002_350_264_123_748_089_4, 17.0]);
        let mut state = EnsembleState::new();
        state.commit(
            WindowRecord {
                window: 63,
                validation_start: d,
                trade_start: d,
                trade_end: d,
                turbulence_threshold: TurbulenceThreshold::Disabled,
                chosen: AgentVariant::OffPolicy,
                sharpe: [(AgentVariant::OffPolicy, 0.1 + 0.2)].into_iter().collect(),
                failed: vec![],
            },
            portfolio.clone(),
        );
        audit.write_state(&state, &[AgentVariant::OffPolicy]).unwrap();

        let json = fs::read_to_string(tmp.path().join("ensemble_state.json")).unwrap();
        let reloaded: EnsembleState = serde_json::from_str(&json).unwrap();
        assert_eq!(reloaded.portfolio(), Some(&portfolio));
        assert_eq!(
            reloaded.sharpe_history(AgentVariant::OffPolicy),
            vec![0.1 + 0.2]
        );
    }

    #[test]
    fn test_selection_table() {
        let tmp = tempfile::tempdir().unwrap();
        let audit = AuditWriter::new(tmp.path()).unwrap();
        let d = NaiveDate::from_ymd_opt(2016, 1, 4).unwrap();
        let mut state = EnsembleState::new();
        state.commit(
            WindowRecord {
                window: 126,
                validation_start: d,
                trade_start: d,
                trade_end: d,
                turbulence_threshold: TurbulenceThreshold::Baseline(96.5),
                chosen: AgentVariant::ActorCritic,
                sharpe: [(AgentVariant::ActorCritic, 0.5)].into_iter().collect(),
                failed: vec![AgentVariant::TrustRegion],
            },
            PortfolioState::from_vec(vec![1.0, 0.0]),
        );
        audit
            .write_state(&state, &[AgentVariant::ActorCritic, AgentVariant::TrustRegion])
            .unwrap();

        let table = fs::read_to_string(tmp.path().join("model_selection.csv")).unwrap();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(
            lines[0],
            "window,validation_start,trade_start,trade_end,turbulence_threshold,chosen,actor_critic_sharpe,trust_region_sharpe"
        );
        assert_eq!(lines[1], "126,2016-01-04,2016-01-04,2016-01-04,96.5,actor_critic,0.5,");
        assert!(tmp.path().join("ensemble_state.json").exists());
    }
}
