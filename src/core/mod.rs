//! Authorization core components

pub mod audit;
pub mod config;
pub mod error;
pub mod iam;
pub mod reload;
pub mod shutdown;
pub mod store;
