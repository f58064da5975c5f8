pub mod dataset;
pub mod error;
pub mod state;
pub mod stats;
pub mod traits;
pub mod types;

pub use dataset::*;
pub use error::*;
pub use state::*;
pub use traits::*;
pub use types::*;
