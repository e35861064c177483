pub mod config;
pub mod decoder;
pub mod gate;
pub mod logger;
pub mod models;
pub mod relay;
pub mod router;
pub mod sanitize;
pub mod upstream;
