#![forbid(unsafe_code)]

pub mod cli;
pub mod driver;
pub mod fetch;
pub mod formats;
pub mod key;
pub mod logging;
pub mod parse;
pub mod store;
