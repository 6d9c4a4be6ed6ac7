#![doc = include_str!("../README.md")]

mod error;
mod options;
mod pool;
mod protocol;
mod unit;

pub use crate::error::*;
pub use crate::options::*;
pub use crate::pool::{Lifecycle, Pool, PoolStatus};
