pub mod client;
#[cfg(test)]
pub mod mock;
pub mod models;
pub mod program;

pub use client::{LedgerClient, RpcLedgerClient};
pub use program::InheritanceProgram;
