//! Remote clients: public price feed and signed futures exchange account.

mod exchange_client;
mod price_feed;
mod types;

pub use exchange_client::ExchangeClient;
pub use price_feed::{PriceFeed, QuoteSource};
pub use types::*;

#[cfg(test)]
pub(crate) use price_feed::tests::StaticQuotes;
