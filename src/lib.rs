pub mod camera;
pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod pool;
pub mod processor;
pub mod protocol;
pub mod recognizer;
pub mod registry;
pub mod server;
