#[macro_use]
mod util;
pub use util::named;

pub mod args;
pub mod cast;
pub mod client;
pub mod discovery;
pub mod error;
pub mod message;
pub mod payload;
pub mod resolver;
pub mod serve;
pub mod types;

pub use error::{Error, Result};
