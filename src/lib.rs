pub mod config;
pub mod interactive;
pub mod interpreter;
pub mod llm;
pub mod logging;
pub mod models;
pub mod resolver;
pub mod scheduler;
pub mod storage;
