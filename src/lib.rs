// 导出模块
pub mod frcommon;
pub mod fragg;

// Re-export error types
pub use frcommon::error::AppError;
