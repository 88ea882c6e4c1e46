// =============================================================================
// Execution layer — aggregator client and order executor
// =============================================================================

pub mod executor;
pub mod jupiter;

pub use executor::{ExecutionOutcome, Executor};
pub use jupiter::{JupiterClient, Quote};
