pub mod config;
pub mod frames;
