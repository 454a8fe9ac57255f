pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod job;
pub mod merge;
pub mod pipeline;
pub mod pool;
pub mod prepared;
pub mod progress;
pub mod refine;
pub mod session;
mod transaction;

pub use client::{HistoryLookup, QueryClient};
pub use config::{RefineConfig, load_config};
pub use error::{DaemonError, DaemonErrorCode, OrderError, RefineError};
pub use pipeline::{Pipeline, Refiner, Rule};
pub use prepared::{PreparedUpdateRefiner, PreparedUpdates};
pub use progress::{PluginStatus, ProgressCallback, ProgressUpdate};
pub use refine::PackageRefiner;
pub use session::{Session, SessionFactory, SessionManager};
