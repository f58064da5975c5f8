use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;

use ensemble_core::{MarketDataset, MarketRow};

/// Indicator columns carried into each instrument's feature vector, in this
/// order, when present in the header.
pub const FEATURE_COLUMNS: [&str; 8] = ["open", "high", "low", "volume", "macd", "rsi", "cci", "adx"];

/// `YYYYMMDD` (optionally with a trailing `.0`) or ISO `YYYY-MM-DD`.
pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    let raw = raw.trim();
    let compact = raw.strip_suffix(".0").unwrap_or(raw);
    NaiveDate::parse_from_str(compact, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .with_context(|| format!("unrecognised date '{raw}'"))
}

pub fn load_dataset(path: &Path) -> Result<MarketDataset> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open dataset {}", path.display()))?;
    let rows = parse_market_rows(file)?;
    tracing::info!(rows = rows.len(), path = %path.display(), "Market data loaded");
    MarketDataset::from_rows(rows).context("market data failed integrity checks")
}

/// Parse `datadate,tic,adjcp[,features..][,turbulence]` rows. Column order is
/// taken from the header; a missing turbulence column reads as 0.
pub fn parse_market_rows(input: impl Read) -> Result<Vec<MarketRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(input);

    let headers = reader.headers()?.clone();
    let column = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));
    let date_col = column("datadate").context("missing 'datadate' column")?;
    let tic_col = column("tic").context("missing 'tic' column")?;
    let close_col = column("adjcp").context("missing 'adjcp' column")?;
    let turbulence_col = column("turbulence");
    let feature_cols: Vec<usize> = FEATURE_COLUMNS.iter().filter_map(|c| column(*c)).collect();

    let number = |record: &csv::StringRecord, col: usize, line: usize| -> Result<f64> {
        let raw = record.get(col).unwrap_or("");
        raw.parse()
            .with_context(|| format!("line {line}: '{raw}' is not a number"))
    };

    let mut rows = Vec::new();
    for (i, result) in reader.records().enumerate() {
        let record = result?;
        let line = i + 2;
        let date = parse_date(record.get(date_col).unwrap_or(""))
            .with_context(|| format!("line {line}"))?;
        let ticker = record.get(tic_col).unwrap_or("").to_string();
        if ticker.is_empty() {
            anyhow::bail!("line {line}: empty ticker");
        }
        let features = feature_cols
            .iter()
            .map(|c| number(&record, *c, line))
            .collect::<Result<Vec<f64>>>()?;
        let turbulence = match turbulence_col {
            Some(c) => number(&record, c, line)?,
            None => 0.0,
        };

        rows.push(MarketRow {
            date,
            ticker,
            close: number(&record, close_col, line)?,
            features,
            turbulence,
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2016, 1, 4).unwrap();
        assert_eq!(parse_date("20160104").unwrap(), expected);
        assert_eq!(parse_date("20160104.0").unwrap(), expected);
        assert_eq!(parse_date("2016-01-04").unwrap(), expected);
        assert!(parse_date("04/01/2016").is_err());
    }

    #[test]
    fn test_parse_rows_with_features_and_turbulence() {
        let csv = "\
datadate,tic,adjcp,open,macd,rsi,turbulence
20160104,AAPL,105.35,102.61,-1.2,45.0,12.5
20160104,MSFT,54.80,54.32,0.3,55.1,12.5
20160105,AAPL,102.71,105.75,-1.4,41.9,30.0
";
        let rows = parse_market_rows(csv.as_bytes()).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].ticker, "MSFT");
        assert_eq!(rows[0].features, vec![102.61, -1.2, 45.0]);
        assert_eq!(rows[2].turbulence, 30.0);
    }

    #[test]
    fn test_missing_turbulence_defaults_to_zero() {
        let csv = "tic,datadate,adjcp\nAAPL,2016-01-04,105.35\n";
        let rows = parse_market_rows(csv.as_bytes()).unwrap();
        assert_eq!(rows[0].turbulence, 0.0);
        assert!(rows[0].features.is_empty());
    }

    #[test]
    fn test_bad_rows_rejected() {
        assert!(parse_market_rows("tic,adjcp\nAAPL,1.0\n".as_bytes()).is_err());
        assert!(parse_market_rows("datadate,tic,adjcp\n20160104,AAPL,abc\n".as_bytes()).is_err());
        assert!(parse_market_rows("datadate,tic,adjcp\n20160104,,1.0\n".as_bytes()).is_err());
    }

    #[test]
    fn test_load_dataset_groups_by_date() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("prices.csv");
        std::fs::write(
            &path,
            "datadate,tic,adjcp\n20160104,MSFT,54.8\n20160104,AAPL,105.35\n20160105,AAPL,102.71\n20160105,MSFT,54.2\n",
        )
        .unwrap();
        let dataset = load_dataset(&path).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.tickers(), &["AAPL".to_string(), "MSFT".to_string()]);
        assert_eq!(dataset.days()[0].prices, vec![105.35, 54.8]);
    }
}
