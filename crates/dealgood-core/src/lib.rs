pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod outcome;
pub mod pacer;
pub mod request;
pub mod source;
pub mod stats;

pub use client::*;
pub use config::*;
pub use dispatcher::*;
pub use error::*;
pub use outcome::*;
pub use pacer::*;
pub use request::*;
pub use source::{open_source, RequestSource, SourceKind, SourceOptions};
pub use stats::*;
