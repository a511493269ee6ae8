//! Portfolio state for a single pipeline run.
//!
//! The [`PortfolioReader`] turns the vault state reported by the chain
//! gateway into an immutable [`PortfolioSnapshot`] tagged with a run id.

mod reader;
mod types;

pub use reader::PortfolioReader;
pub use types::{strategy_key, PortfolioSnapshot, RunId, StrategyPosition};
