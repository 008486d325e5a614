pub mod bybit;

pub use bybit::{BybitClient, ExchangeError, Ticker, BYBIT_API_BASE, BYBIT_TESTNET_API_BASE};
