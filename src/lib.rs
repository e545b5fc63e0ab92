pub mod candidates;
pub mod cli;
pub mod config;
pub mod id;
pub mod ports;
pub mod probe;
pub mod proxy_core;
pub mod results;
pub mod scan;
pub mod template;
pub mod version;
