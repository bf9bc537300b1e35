//! # scanq
//!
//! HTTP service around the [`scanq_tasks`] job engine: configuration,
//! logging bootstrap, backend selection by URL and the job endpoints.
//!
//! ```no_run
//! # async fn start() -> anyhow::Result<()> {
//! let config = scanq::ScanqConfig::load(None)?;
//! scanq::logging::init_logging(config.log_format);
//! scanq::app::run(config).await
//! # }
//! ```

pub mod app;
pub mod config;
pub mod http;
pub mod logging;

pub use config::{ConfigError, LogFormat, ScanqConfig};
pub use scanq_tasks;
