// Exchange connectivity
pub mod binance;
pub mod exchange;
pub mod paper;

pub use binance::BinanceClient;
pub use exchange::Exchange;
pub use paper::PaperExchange;
