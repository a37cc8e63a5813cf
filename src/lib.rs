pub mod api;
pub mod config;
pub mod error;
pub mod job;
pub mod master;
pub mod metrics;
pub mod shutdown;
pub mod store;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("worker");
}
