pub mod app;
pub mod ci;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod dns;
pub mod error;
pub mod inventory;
pub mod provider;
pub mod readiness;
pub mod recipes;
pub mod remote;

pub use error::{Error, Result};
