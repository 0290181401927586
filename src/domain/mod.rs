pub mod free_time;
pub mod models;
pub mod triage;
