//! Kampung Atlas: turns participant postal codes into map markers.
//!
//! The [`postal`] module holds the resolution pipeline. [`input`], [`map`]
//! and [`server`] are the boundary adapters around it.

pub mod config;
pub mod input;
pub mod logging;
pub mod map;
pub mod postal;
pub mod server;
