pub mod apps;
pub mod channel;
pub mod config;
pub mod directory;
pub mod external;
pub mod flow;
pub mod flow_commands;
pub mod logger;
pub mod router;
pub mod schema;
pub mod session;
pub mod state;
pub mod watcher;
