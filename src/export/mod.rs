pub mod clickhouse;
pub mod codec;
pub mod health;
pub mod http;
