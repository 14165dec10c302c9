pub mod config;
pub mod engine;
pub mod fingerprint;
pub mod handler;
pub mod model;
pub mod selector;
pub mod stats;
pub mod store;
pub mod util;
