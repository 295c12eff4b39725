pub mod audio;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod networking;
pub mod sdk;
pub mod server;
pub mod services;
pub mod worker;

pub use error::{Error, Result};
