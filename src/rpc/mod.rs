// =============================================================================
// Chain RPC layer — budget governor, JSON-RPC gateway, pub/sub multiplexer
// =============================================================================

pub mod budget;
pub mod client;
pub mod subscriptions;

pub use budget::BudgetGovernor;
pub use client::{RpcGateway, TokenAccountView};
pub use subscriptions::{SubKey, SubscriptionMultiplexer};
