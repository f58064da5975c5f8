//! Reference multi-stock trading environment and baseline agents.
//!
//! [`StockTradingEnv`] keeps a cash-and-holdings ledger over an episode of
//! daily closes. [`LinearPolicyAgent`] is a small linear policy trained by
//! seeded random search, one hyperparameter set per agent variant.

pub mod agents;
pub mod env;


pub use agents::{BaselineAgentFactory, HoldAgent, LinearPolicyAgent, SearchParams};
pub use env::{StockEnvFactory, StockTradingEnv, HMAX_NORMALIZE, REWARD_SCALING, TRANSACTION_FEE_PERCENT};
