pub mod config;
pub mod error;
pub mod graph_calendar_client;
pub mod openai_client;
pub mod storage;
pub mod suggestion_store;
pub mod todoist_client;
