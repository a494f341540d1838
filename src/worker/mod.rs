//! External worker communication and instance selection.

pub mod client;
pub mod pool;

pub use client::{
    render_endpoint, HttpWorkerTransport, StartPart, StartRequest, StartResponse, WorkerTransport,
};
pub use pool::{InstancePool, Selection};
