pub mod config;
pub mod database;
pub mod event_repository;

pub use config::DatabaseConfig;
pub use database::Database;
pub use event_repository::BlockingEventRepository;
