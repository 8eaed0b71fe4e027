pub mod ingestor;
pub mod repository;

pub use ingestor::{IngestorSettings, MarketDataIngestor};
pub use repository::MarketDataRepository;
