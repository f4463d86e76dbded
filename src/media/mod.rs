pub mod engine;
pub mod plan;
pub mod ports;
pub mod relay;
pub mod transcode;
pub mod types;
