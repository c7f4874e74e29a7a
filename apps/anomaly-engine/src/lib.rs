pub mod algorithms;
pub mod config;
pub mod consensus;
pub mod plugin;
pub mod reader;
pub mod second_order;
pub mod series;
pub mod store;
pub mod sweep;
pub mod vacuum;
