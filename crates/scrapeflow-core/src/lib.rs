pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{GraphError, Result, ScrapeError};
pub use event::{EventBus, GraphEvent};
pub use types::*;
