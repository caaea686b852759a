pub mod cli;
pub mod conditions;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod lock;
pub mod policy;
pub mod storage;
pub mod vault;
