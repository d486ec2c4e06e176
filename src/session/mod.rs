pub mod conversation;
pub mod manager;
pub mod queue;
pub mod store;
pub mod timer;
