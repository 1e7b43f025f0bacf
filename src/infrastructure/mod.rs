//! 基础设施层：持有稀缺资源（数据库连接、临时文件），只暴露能力

pub mod database;
pub mod staging;

pub use database::Database;
pub use staging::{StagedFile, StagingArea};
