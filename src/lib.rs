pub mod alerts;
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod reactor;
pub mod router;
pub mod server;
pub mod syscalls;
pub mod websocket;

// Re-exports for users
pub use alerts::{Alert, AlertKind, AlertManager};
pub use config::Config;
pub use error::{ServerError, ServerResult};
pub use http::{Method, Request, Response};
pub use metrics::{MetricsCollector, MetricsStorage, SystemMetrics};
pub use pool::WorkerPool;
pub use reactor::Reactor;
pub use router::Router;
pub use server::Server;
