pub mod analytics;
pub mod config;
pub mod http_client;
pub mod parser;
pub mod processor;
pub mod queue;
pub mod rate_limiter;
pub mod record;
pub mod scheduler;
pub mod server;
pub mod status;
pub mod store;
pub mod ui;
pub mod writer;

#[cfg(test)]
mod test_support;
