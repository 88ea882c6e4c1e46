// =============================================================================
// Market data layer — pair feed, price cache, discovery, price history
// =============================================================================

pub mod discovery;
pub mod history;
pub mod pair;
pub mod price_cache;

pub use discovery::DiscoveryAggregator;
pub use history::HistoryClient;
pub use pair::{PairClient, PairSnapshot};
pub use price_cache::{PriceCache, PriceContext};
