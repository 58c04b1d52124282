pub mod config;
pub mod cursor;
pub mod db;
pub mod error;
pub mod graph;
pub mod message;
pub mod named;
pub mod node;
pub mod pool;
pub mod status;
pub mod template;
pub mod tick;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
