#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod allocation;
pub mod error;
pub mod proto;
pub mod relay;

pub use error::Error;
