pub mod batch;
pub mod config;
pub mod detector;
pub mod error;
pub mod filter;
pub mod grpc;
pub mod monitor;
pub mod pipeline;
pub mod store;
