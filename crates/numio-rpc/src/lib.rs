pub mod api;
pub mod server;
pub mod types;

pub use api::NumioApiServer;
pub use server::{RpcServer, RpcServerState};
pub use types::{HealthBoard, WorkerHealth};
