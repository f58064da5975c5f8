use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{EnsembleError, Result};
use crate::types::TradingDay;

/// A single (date, instrument) observation as read from disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketRow {
    pub date: NaiveDate,
    pub ticker: String,
    pub close: f64,
    #[serde(default)]
    pub features: Vec<f64>,
    #[serde(default)]
    pub turbulence: f64,
}

/// Immutable, date-ordered market history.
///
/// Rows are grouped into one [`TradingDay`] per unique date, so every
/// date-level query is already deduplicated. Every date carries the same
/// instrument set in the same (ticker-sorted) order.
#[derive(Debug, Clone)]
pub struct MarketDataset {
    tickers: Vec<String>,
    days: Vec<TradingDay>,
}

/// Environment input: `warmup` lookback days followed by the scored days.
#[derive(Debug, Clone)]
pub struct Episode {
    pub warmup: usize,
    pub days: Vec<TradingDay>,
}

impl Episode {
    /// Days the environment actually steps through.
    pub fn scored(&self) -> &[TradingDay] {
        &self.days[self.warmup.min(self.days.len())..]
    }

    /// Lookback history preceding the scored days.
    pub fn history(&self) -> &[TradingDay] {
        &self.days[..self.warmup.min(self.days.len())]
    }
}

impl MarketDataset {
    pub fn from_rows(rows: Vec<MarketRow>) -> Result<Self> {
        if rows.is_empty() {
            return Err(EnsembleError::DataIntegrity("dataset has no rows".to_string()));
        }

        let mut by_date: BTreeMap<NaiveDate, BTreeMap<String, MarketRow>> = BTreeMap::new();
        for row in rows {
            let date = row.date;
            let ticker = row.ticker.clone();
            if by_date.entry(date).or_default().insert(ticker.clone(), row).is_some() {
                return Err(EnsembleError::DataIntegrity(format!(
                    "duplicate row for {ticker} on {date}"
                )));
            }
        }

        let tickers: Vec<String> = by_date
            .values()
            .next()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();

        let mut days = Vec::with_capacity(by_date.len());
        for (date, instruments) in by_date {
            if instruments.len() != tickers.len()
                || !instruments.keys().zip(&tickers).all(|(a, b)| a == b)
            {
                return Err(EnsembleError::DataIntegrity(format!(
                    "instrument set on {date} differs from the first date ({} vs {})",
                    instruments.len(),
                    tickers.len()
                )));
            }
            // Turbulence is market-wide; keep the first row's value for the date.
            let turbulence = instruments.values().next().map(|r| r.turbulence).unwrap_or(0.0);
            let (prices, features): (Vec<f64>, Vec<Vec<f64>>) = instruments
                .into_values()
                .map(|r| (r.close, r.features))
                .unzip();
            days.push(TradingDay {
                date,
                prices,
                features,
                turbulence,
            });
        }

        Self::from_days(tickers, days)
    }

    /// Build from already-grouped days. Dates must be strictly increasing.
    pub fn from_days(tickers: Vec<String>, days: Vec<TradingDay>) -> Result<Self> {
        if days.is_empty() {
            return Err(EnsembleError::DataIntegrity("dataset has no dates".to_string()));
        }
        for pair in days.windows(2) {
            if pair[1].date <= pair[0].date {
                return Err(EnsembleError::DataIntegrity(format!(
                    "dates not strictly increasing: {} then {}",
                    pair[0].date, pair[1].date
                )));
            }
        }
        let feature_len = days[0].features.first().map(Vec::len).unwrap_or(0);
        for day in &days {
            if day.prices.len() != tickers.len() || day.features.len() != tickers.len() {
                return Err(EnsembleError::DataIntegrity(format!(
                    "{} has {} prices for {} instruments",
                    day.date,
                    day.prices.len(),
                    tickers.len()
                )));
            }
            if day.features.iter().any(|f| f.len() != feature_len) {
                return Err(EnsembleError::DataIntegrity(format!(
                    "{} has ragged feature vectors",
                    day.date
                )));
            }
        }
        Ok(Self { tickers, days })
    }

    pub fn tickers(&self) -> &[String] {
        &self.tickers
    }

    pub fn stock_dimension(&self) -> usize {
        self.tickers.len()
    }

    pub fn days(&self) -> &[TradingDay] {
        &self.days
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn first_date(&self) -> NaiveDate {
        self.days[0].date
    }

    /// Unique trading dates, ascending.
    pub fn dates(&self) -> Vec<NaiveDate> {
        self.days.iter().map(|d| d.date).collect()
    }

    /// Index of the first day on or after `date` (`len()` if none).
    pub fn position(&self, date: NaiveDate) -> usize {
        self.days.partition_point(|d| d.date < date)
    }

    /// Days in `[start, end)`.
    pub fn slice(&self, start: NaiveDate, end: NaiveDate) -> &[TradingDay] {
        let lo = self.position(start);
        let hi = self.position(end).max(lo);
        &self.days[lo..hi]
    }

    /// Index `lookback` days before `date`, clamped at the first date.
    pub fn lookback_start(&self, date: NaiveDate, lookback: usize) -> usize {
        self.position(date).saturating_sub(lookback)
    }

    /// Owned episode over `[start, end)` left-padded with up to `lookback`
    /// earlier days.
    pub fn episode(&self, start: NaiveDate, end: NaiveDate, lookback: usize) -> Episode {
        let from = self.lookback_start(start, lookback);
        let lo = self.position(start);
        let hi = self.position(end).max(lo);
        Episode {
            warmup: lo - from,
            days: self.days[from..hi].to_vec(),
        }
    }

    /// Per-date turbulence over `[start, end)`.
    pub fn turbulence_between(&self, start: NaiveDate, end: NaiveDate) -> Vec<f64> {
        self.slice(start, end).iter().map(|d| d.turbulence).collect()
    }

    /// Unique dates in `(after, through]`; open bounds when `None`.
    pub fn trade_calendar(
        &self,
        after: Option<NaiveDate>,
        through: Option<NaiveDate>,
    ) -> Vec<NaiveDate> {
        self.days
            .iter()
            .map(|d| d.date)
            .filter(|d| after.map_or(true, |a| *d > a))
            .filter(|d| through.map_or(true, |t| *d <= t))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(offset: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 1, 1).unwrap() + chrono::Duration::days(offset)
    }

    fn row(offset: i64, ticker: &str, close: f64, turbulence: f64) -> MarketRow {
        MarketRow {
            date: date(offset),
            ticker: ticker.to_string(),
            close,
            features: vec![close * 0.1],
            turbulence,
        }
    }

    fn two_stock_dataset(n: i64) -> MarketDataset {
        let mut rows = Vec::new();
        for i in (0..n).rev() {
            rows.push(row(i, "MSFT", 200.0 + i as f64, i as f64));
            rows.push(row(i, "AAPL", 100.0 + i as f64, i as f64));
        }
        MarketDataset::from_rows(rows).unwrap()
    }

    #[test]
    fn test_rows_grouped_by_date_in_ticker_order() {
        let ds = two_stock_dataset(5);
        assert_eq!(ds.len(), 5);
        assert_eq!(ds.stock_dimension(), 2);
        assert_eq!(ds.tickers(), &["AAPL".to_string(), "MSFT".to_string()]);
        assert_eq!(ds.days()[0].date, date(0));
        assert_eq!(ds.days()[2].prices, vec![102.0, 202.0]);
    }

    #[test]
    fn test_dates_strictly_increasing() {
        let ds = two_stock_dataset(10);
        let dates = ds.dates();
        assert!(dates.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_duplicate_row_rejected() {
        let rows = vec![row(0, "AAPL", 1.0, 0.0), row(0, "AAPL", 2.0, 0.0)];
        assert!(matches!(
            MarketDataset::from_rows(rows),
            Err(EnsembleError::DataIntegrity(_))
        ));
    }

    #[test]
    fn test_missing_instrument_rejected() {
        let rows = vec![
            row(0, "AAPL", 1.0, 0.0),
            row(0, "MSFT", 1.0, 0.0),
            row(1, "AAPL", 1.0, 0.0),
        ];
        assert!(MarketDataset::from_rows(rows).is_err());
    }

    #[test]
    fn test_slice_is_half_open() {
        let ds = two_stock_dataset(10);
        let days = ds.slice(date(2), date(5));
        assert_eq!(days.len(), 3);
        assert_eq!(days[0].date, date(2));
        assert_eq!(days[2].date, date(4));
        assert!(ds.slice(date(5), date(5)).is_empty());
    }

    #[test]
    fn test_episode_lookback_clamped_at_first_date() {
        let ds = two_stock_dataset(10);
        let ep = ds.episode(date(3), date(6), 80);
        assert_eq!(ep.warmup, 3);
        assert_eq!(ep.history()[0].date, date(0));
        assert_eq!(ep.scored().len(), 3);
        assert_eq!(ep.scored()[0].date, date(3));

        let ep = ds.episode(date(6), date(8), 2);
        assert_eq!(ep.warmup, 2);
        assert_eq!(ep.history()[0].date, date(4));
    }

    #[test]
    fn test_trade_calendar_bounds() {
        let ds = two_stock_dataset(10);
        let cal = ds.trade_calendar(Some(date(2)), Some(date(6)));
        assert_eq!(cal.first(), Some(&date(3)));
        assert_eq!(cal.last(), Some(&date(6)));
        assert_eq!(ds.trade_calendar(None, None).len(), 10);
    }

    #[test]
    fn test_turbulence_deduplicated_by_date() {
        let ds = two_stock_dataset(6);
        assert_eq!(ds.turbulence_between(date(1), date(4)), vec![1.0, 2.0, 3.0]);
    }
}
