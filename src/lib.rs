#![allow(clippy::uninlined_format_args)]

pub mod api;
pub mod app;
pub mod config;
pub mod echo;
pub mod logging;
pub mod media;
pub mod oauth;
pub mod profile;
pub mod render;
pub mod shorturl;
pub mod upload;

#[cfg(test)]
mod testing;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
