// Postgres event log
pub mod postgres;

pub use postgres::PostgresEventLog;
