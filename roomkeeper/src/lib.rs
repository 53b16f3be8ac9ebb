pub mod config;
pub mod engine;
pub mod gateway;
pub mod report;
pub mod strategy;
