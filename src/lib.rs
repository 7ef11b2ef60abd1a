pub mod cleanup;
pub mod config;
pub mod frontier;
pub mod graph;
pub mod store;
