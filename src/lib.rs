//! An asynchronous MySQL/MariaDB wire-protocol client and connection pool.

pub mod charset;
pub mod config;
pub mod constant;
pub mod error;
pub mod escape;
mod opts;
pub mod protocol;
pub mod tokio;
pub mod value;

pub use error::{Error, Result};
pub use escape::{Param, Params};
pub use opts::Opts;
pub use value::Value;
