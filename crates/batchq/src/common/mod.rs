#[macro_use]
pub mod macros;

pub mod error;
pub mod parser;
pub mod rpc;
pub mod setup;
pub mod utils;
