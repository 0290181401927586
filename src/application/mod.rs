pub mod aggregator;
pub mod bootstrap;
pub mod commands;
pub mod context;
pub mod progress;
pub mod suggestion_cache;
