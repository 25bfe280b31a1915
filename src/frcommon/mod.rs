// 导出共享模块
pub mod boundary;
pub mod config;
pub mod db;
pub mod error;
pub mod logging_setup;
pub mod models;
pub mod websocket;

// 重新导出常用类型，方便使用
pub use boundary::{detect_boundary, format_datetime, is_aligned, BoundaryCrossing};
pub use config::FundingRateConfig;
pub use db::{PersistenceGateway, SqliteGateway, SymbolDiff};
pub use error::{handle_error, AppError, ErrorPolicy, Result};
pub use models::{BucketRecord, CoinListing, ColumnValue, Interval, SymbolStatus, Tick, TickBatch};
