use tracing::debug;

use ensemble_core::stats::{mean, pct_change};
use ensemble_core::{
    EnsembleError, EnvConfig, EnvMode, Environment, EnvironmentFactory, Episode, PortfolioState,
    Result, StepInfo, StepOutcome, TradingDay,
};

/// Shares traded for an action of magnitude 1.
pub const HMAX_NORMALIZE: f64 = 100.0;

/// Fee charged on the notional of every buy and sell.
pub const TRANSACTION_FEE_PERCENT: f64 = 0.001;

/// Scales the change in account value into the step reward.
pub const REWARD_SCALING: f64 = 1e-4;

/// Multi-stock cash-and-holdings ledger over one episode.
///
/// Observation layout: `[cash, prices.., holdings.., features.., lookback
/// mean returns..]`. Features are the per-instrument indicator vectors
/// concatenated in ticker order; lookback mean returns are per instrument,
/// over the episode's warmup span ending at the current day.
///
/// Actions are in `[-1, 1]` per instrument and scaled to whole shares by
/// [`HMAX_NORMALIZE`]. Sells settle before buys. When turbulence gating is on
/// and the day's turbulence reaches the threshold, every position is sold
/// and no buys are accepted that day.
#[derive(Debug, Clone)]
pub struct StockTradingEnv {
    days: Vec<TradingDay>,
    warmup: usize,
    stock_dimension: usize,
    mode: EnvMode,
    iteration: usize,
    turbulence_threshold: f64,
    use_turbulence: bool,
    start: PortfolioState,
    cursor: usize,
    cash: f64,
    holdings: Vec<f64>,
    cost: f64,
    trades: usize,
    asset_memory: Vec<f64>,
}

impl StockTradingEnv {
    pub fn new(episode: Episode, config: EnvConfig) -> Result<Self> {
        let dim = config.stock_dimension;
        if let Some(bad) = episode.days.iter().find(|d| d.prices.len() != dim) {
            return Err(EnsembleError::DataIntegrity(format!(
                "{} has {} prices, environment expects {dim}",
                bad.date,
                bad.prices.len()
            )));
        }

        let start = match (&config.previous_state, config.initial) {
            (Some(state), false) => {
                state.check_shape(dim)?;
                state.clone()
            }
            (None, false) => {
                return Err(EnsembleError::DataIntegrity(
                    "non-initial environment built without a previous state".to_string(),
                ))
            }
            (_, true) => PortfolioState::initial(config.initial_capital, dim),
        };

        let mut env = Self {
            warmup: episode.warmup.min(episode.days.len()),
            days: episode.days,
            stock_dimension: dim,
            mode: config.mode,
            iteration: config.iteration,
            turbulence_threshold: config.turbulence_threshold,
            use_turbulence: config.use_turbulence,
            cash: start.cash(),
            holdings: start.holdings().to_vec(),
            start,
            cursor: 0,
            cost: 0.0,
            trades: 0,
            asset_memory: Vec::new(),
        };
        env.asset_memory.push(env.account_value());
        Ok(env)
    }

    fn scored_len(&self) -> usize {
        self.days.len() - self.warmup
    }

    /// The day the next action trades at.
    fn today(&self) -> Option<&TradingDay> {
        self.days.get(self.warmup + self.cursor)
    }

    fn prices(&self) -> &[f64] {
        self.today().map(|d| d.prices.as_slice()).unwrap_or(&[])
    }

    /// Total transaction fees paid this episode.
    pub fn cost(&self) -> f64 {
        self.cost
    }

    /// Buy and sell fills this episode.
    pub fn trades(&self) -> usize {
        self.trades
    }

    /// Account value after reset and after every trading step.
    pub fn asset_memory(&self) -> &[f64] {
        &self.asset_memory
    }

    fn observation(&self) -> Vec<f64> {
        let mut obs = Vec::with_capacity(1 + 3 * self.stock_dimension);
        obs.push(self.cash);
        match self.today() {
            Some(day) => {
                obs.extend_from_slice(&day.prices);
                obs.extend_from_slice(&self.holdings);
                obs.extend(day.features.iter().flatten().copied());
            }
            None => {
                obs.extend(std::iter::repeat(0.0).take(self.stock_dimension));
                obs.extend_from_slice(&self.holdings);
            }
        }
        obs.extend(self.lookback_returns());
        obs
    }

    fn lookback_returns(&self) -> Vec<f64> {
        let end = (self.warmup + self.cursor + 1).min(self.days.len());
        let start = end.saturating_sub(self.warmup + 1);
        let span = &self.days[start..end];
        (0..self.stock_dimension)
            .map(|i| {
                let closes: Vec<f64> = span.iter().map(|d| d.prices[i]).collect();
                let returns: Vec<f64> = pct_change(&closes)
                    .into_iter()
                    .filter(|r| r.is_finite())
                    .collect();
                let m = mean(&returns);
                if m.is_nan() {
                    0.0
                } else {
                    m
                }
            })
            .collect()
    }

    fn sell(&mut self, index: usize, shares: f64, price: f64) {
        let shares = shares.min(self.holdings[index]);
        if shares <= 0.0 || price <= 0.0 {
            return;
        }
        let notional = price * shares;
        self.cash += notional * (1.0 - TRANSACTION_FEE_PERCENT);
        self.cost += notional * TRANSACTION_FEE_PERCENT;
        self.holdings[index] -= shares;
        self.trades += 1;
    }

    fn buy(&mut self, index: usize, shares: f64, price: f64) {
        if price <= 0.0 {
            return;
        }
        let affordable = (self.cash / (price * (1.0 + TRANSACTION_FEE_PERCENT))).floor();
        let shares = shares.min(affordable);
        if shares <= 0.0 {
            return;
        }
        let notional = price * shares;
        self.cash -= notional * (1.0 + TRANSACTION_FEE_PERCENT);
        self.cost += notional * TRANSACTION_FEE_PERCENT;
        self.holdings[index] += shares;
        self.trades += 1;
    }
}

impl Environment for StockTradingEnv {
    fn reset(&mut self) -> Result<Vec<f64>> {
        self.cursor = 0;
        self.cash = self.start.cash();
        self.holdings = self.start.holdings().to_vec();
        self.cost = 0.0;
        self.trades = 0;
        self.asset_memory.clear();
        self.asset_memory.push(self.account_value());
        Ok(self.observation())
    }

    fn step(&mut self, action: &[f64]) -> Result<StepOutcome> {
        if action.len() != self.stock_dimension {
            return Err(EnsembleError::Agent(format!(
                "action has {} entries, expected {}",
                action.len(),
                self.stock_dimension
            )));
        }

        let turbulence = self.today().map(|d| d.turbulence).unwrap_or(0.0);
        if self.cursor + 1 >= self.scored_len() {
            debug!(
                mode = ?self.mode,
                iteration = self.iteration,
                end_total_asset = self.account_value(),
                total_cost = self.cost,
                total_trades = self.trades,
                "Episode finished"
            );
            return Ok(StepOutcome {
                observation: self.observation(),
                reward: 0.0,
                done: true,
                info: StepInfo {
                    account_value: self.account_value(),
                    turbulence,
                    gated: false,
                },
            });
        }

        let begin = self.account_value();
        let prices = self.prices().to_vec();
        let gated = self.use_turbulence && turbulence >= self.turbulence_threshold;

        if gated {
            for i in 0..self.stock_dimension {
                let held = self.holdings[i];
                self.sell(i, held, prices[i]);
            }
        } else {
            let scaled: Vec<f64> = action
                .iter()
                .map(|a| {
                    if a.is_finite() {
                        a.clamp(-1.0, 1.0) * HMAX_NORMALIZE
                    } else {
                        0.0
                    }
                })
                .collect();
            let mut order: Vec<usize> = (0..self.stock_dimension).collect();
            order.sort_by(|&a, &b| scaled[a].total_cmp(&scaled[b]));

            for &i in order.iter().filter(|&&i| scaled[i] < 0.0) {
                self.sell(i, scaled[i].abs().floor(), prices[i]);
            }
            for &i in order.iter().rev().filter(|&&i| scaled[i] > 0.0) {
                self.buy(i, scaled[i].floor(), prices[i]);
            }
        }

        self.cursor += 1;
        let end = self.account_value();
        self.asset_memory.push(end);

        Ok(StepOutcome {
            observation: self.observation(),
            reward: (end - begin) * REWARD_SCALING,
            done: false,
            info: StepInfo {
                account_value: end,
                turbulence,
                gated,
            },
        })
    }

    fn render(&self) -> PortfolioState {
        let mut state = Vec::with_capacity(self.stock_dimension + 1);
        state.push(self.cash);
        state.extend_from_slice(&self.holdings);
        PortfolioState::from_vec(state)
    }

    fn account_value(&self) -> f64 {
        let prices = self.prices();
        if prices.is_empty() {
            return self.cash;
        }
        self.cash
            + self
                .holdings
                .iter()
                .zip(prices)
                .map(|(h, p)| h * p)
                .sum::<f64>()
    }

    fn action_dimension(&self) -> usize {
        self.stock_dimension
    }
}

/// Builds [`StockTradingEnv`]s for the orchestrator.
#[derive(Debug, Clone, Copy, Default)]
pub struct StockEnvFactory;

impl EnvironmentFactory for StockEnvFactory {
    fn build(&self, episode: Episode, config: EnvConfig) -> Result<Box<dyn Environment>> {
        Ok(Box::new(StockTradingEnv::new(episode, config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(offset: i64, prices: &[f64], turbulence: f64) -> TradingDay {
        TradingDay {
            date: chrono::NaiveDate::from_ymd_opt(2016, 1, 4).unwrap()
                + chrono::Duration::days(offset),
            prices: prices.to_vec(),
            features: prices.iter().map(|p| vec![p * 0.01]).collect(),
            turbulence,
        }
    }

    fn config(initial: bool, previous_state: Option<PortfolioState>) -> EnvConfig {
        EnvConfig {
            mode: EnvMode::Trade,
            turbulence_threshold: 100.0,
            use_turbulence: true,
            initial,
            previous_state,
            stock_dimension: 2,
            initial_capital: 10_000.0,
            iteration: 0,
        }
    }

    fn episode(turbulence: &[f64]) -> Episode {
        Episode {
            warmup: 1,
            days: (0..turbulence.len())
                .map(|i| day(i as i64, &[10.0 + i as f64, 50.0], turbulence[i]))
                .collect(),
        }
    }

    #[test]
    fn test_observation_layout() {
        let mut env = StockTradingEnv::new(episode(&[0.0; 4]), config(true, None)).unwrap();
        let obs = env.reset().unwrap();
        // cash, 2 prices, 2 holdings, 2 features, 2 lookback returns
        assert_eq!(obs.len(), 9);
        assert_eq!(obs[0], 10_000.0);
        assert_eq!(&obs[1..3], &[11.0, 50.0]);
        assert!((obs[7] - 0.1).abs() < 1e-12);
        assert_eq!(obs[8], 0.0);
    }

    #[test]
    fn test_n_scored_days_give_n_minus_one_steps() {
        let mut env = StockTradingEnv::new(episode(&[0.0; 5]), config(true, None)).unwrap();
        env.reset().unwrap();
        let mut steps = 0;
        loop {
            let outcome = env.step(&[0.0, 0.0]).unwrap();
            if outcome.done {
                break;
            }
            steps += 1;
        }
        assert_eq!(steps, 3);
        assert_eq!(env.asset_memory().len(), 4);
    }

    #[test]
    fn test_buy_pays_fee_and_terminal_step_is_noop() {
        let mut env = StockTradingEnv::new(episode(&[0.0; 3]), config(true, None)).unwrap();
        env.reset().unwrap();
        let outcome = env.step(&[0.5, 0.0]).unwrap();
        assert!(!outcome.done);
        let state = env.render();
        assert_eq!(state.holdings(), &[50.0, 0.0]);
        let expected_cash = 10_000.0 - 50.0 * 11.0 * (1.0 + TRANSACTION_FEE_PERCENT);
        assert!((state.cash() - expected_cash).abs() < 1e-9);
        assert!((env.cost() - 0.55).abs() < 1e-9);

        let terminal = env.step(&[1.0, 1.0]).unwrap();
        assert!(terminal.done);
        assert_eq!(terminal.reward, 0.0);
        assert_eq!(env.render(), state);
    }

    #[test]
    fn test_buy_limited_by_cash() {
        let mut env = StockTradingEnv::new(episode(&[0.0; 3]), config(true, None)).unwrap();
        env.reset().unwrap();
        env.step(&[0.0, 1.0]).unwrap();
        env.step(&[0.0, 0.0]).unwrap();
        // 100 shares at 50 cost 5005; 10_000 buys them.
        assert_eq!(env.render().holdings(), &[0.0, 100.0]);

        let seed = PortfolioState::from_vec(vec![1_000.0, 0.0, 0.0]);
        let mut env = StockTradingEnv::new(episode(&[0.0; 3]), config(false, Some(seed))).unwrap();
        env.reset().unwrap();
        env.step(&[0.0, 1.0]).unwrap();
        assert_eq!(env.render().holdings(), &[0.0, 19.0]);
    }

    #[test]
    fn test_turbulence_gate_liquidates_and_blocks_buys() {
        let seed = PortfolioState::from_vec(vec![0.0, 10.0, 4.0]);
        let mut env =
            StockTradingEnv::new(episode(&[0.0, 150.0, 0.0, 0.0]), config(false, Some(seed)))
                .unwrap();
        env.reset().unwrap();
        let outcome = env.step(&[1.0, 1.0]).unwrap();
        assert!(outcome.info.gated);
        let state = env.render();
        assert_eq!(state.holdings(), &[0.0, 0.0]);
        let expected = (10.0 * 11.0 + 4.0 * 50.0) * (1.0 - TRANSACTION_FEE_PERCENT);
        assert!((state.cash() - expected).abs() < 1e-9);

        let outcome = env.step(&[1.0, 0.0]).unwrap();
        assert!(!outcome.info.gated);
        assert!(env.render().holdings()[0] > 0.0);
    }

    #[test]
    fn test_sells_settle_before_buys() {
        let seed = PortfolioState::from_vec(vec![0.0, 0.0, 20.0]);
        let mut env = StockTradingEnv::new(episode(&[0.0; 3]), config(false, Some(seed))).unwrap();
        env.reset().unwrap();
        env.step(&[1.0, -0.2]).unwrap();
        let state = env.render();
        // 20 shares at 50 fund 90 shares at 11 after fees.
        assert_eq!(state.holdings(), &[90.0, 0.0]);
    }

    #[test]
    fn test_previous_state_shape_checked() {
        let seed = PortfolioState::from_vec(vec![1.0, 2.0]);
        let err = StockTradingEnv::new(episode(&[0.0; 3]), config(false, Some(seed))).unwrap_err();
        assert!(matches!(err, EnsembleError::StateShape { expected: 3, actual: 2 }));

        let err = StockTradingEnv::new(episode(&[0.0; 3]), config(false, None)).unwrap_err();
        assert!(matches!(err, EnsembleError::DataIntegrity(_)));
    }

    #[test]
    fn test_initial_ignores_previous_state() {
        let seed = PortfolioState::from_vec(vec![1.0, 2.0, 3.0]);
        let env = StockTradingEnv::new(episode(&[0.0; 3]), config(true, Some(seed))).unwrap();
        assert_eq!(env.render(), PortfolioState::initial(10_000.0, 2));
    }
}
