pub mod context;
pub mod date;
pub mod env_config;
pub mod error;
pub mod hash;
pub mod ip;
pub mod pipeline;
pub mod tag;
