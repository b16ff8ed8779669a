pub mod apps;
pub mod assistant;
pub mod brain;
pub mod config;
pub mod context;
pub mod dialogue;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod flow;
pub mod flow_commands;
pub mod interaction;
pub mod logger;
pub mod session;
pub mod state;
pub mod watcher;
