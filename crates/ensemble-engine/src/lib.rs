pub mod audit;
pub mod cancel;
pub mod models;
pub mod orchestrator;
pub mod scheduler;
pub mod selection;
pub mod trading;
pub mod training;
pub mod turbulence;
pub mod validation;


pub use audit::AuditWriter;
pub use cancel::CancellationToken;
pub use models::*;
pub use orchestrator::EnsembleOrchestrator;
pub use scheduler::{WindowScheduler, Windows};
pub use selection::ModelSelector;
pub use trading::TradingStage;
pub use training::{TrainedAgent, TrainingOutcome, TrainingStage};
pub use turbulence::{TurbulenceBaseline, TurbulenceController};
pub use validation::{sharpe_ratio, ValidationResult, ValidationStage};
