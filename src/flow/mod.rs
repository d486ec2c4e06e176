pub mod condition;
pub mod engine;
pub mod input;
pub mod manager;
pub mod model;
