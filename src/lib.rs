pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod service;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::AppConfig;
pub use db::{create_pool, run_migrations, PgStore};
pub use error::SettlementError;
pub use service::SettlementService;
