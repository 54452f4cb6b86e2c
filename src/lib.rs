pub mod client;
pub mod config;
pub mod consts;
pub mod driver;
pub mod error;
pub mod link;
pub mod message;
pub mod pin;
pub mod state;
