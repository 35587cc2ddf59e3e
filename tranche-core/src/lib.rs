pub mod archive;
pub mod config;
pub mod control;
mod data_uploader;
pub mod encoding;
pub mod error;
pub mod events;
pub mod hash;
mod meta_uploader;
pub mod model;
pub mod net;
mod pipeline;
pub mod producer;
pub mod queue;
pub mod relay;
pub mod replicate;
pub mod report;
pub mod session;
pub mod topology;

pub use config::{Credentials, UploadConfig};
pub use error::{ConfigError, UploadError, ValidationError};
pub use events::{Event, EventKind, Listener};
pub use hash::ContentHash;
pub use report::Report;
pub use session::UploadSession;
