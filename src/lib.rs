#![cfg_attr(doc, doc = include_str!("../README.md"))]

#[cfg(feature = "ws")]
pub mod automation;
pub mod error;
pub mod request;
pub mod types;
#[cfg(feature = "ws")]
pub mod ws;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;
