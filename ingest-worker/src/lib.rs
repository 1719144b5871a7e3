pub mod config;
pub mod error;
pub mod flusher;
pub mod handlers;
pub mod normalize;
pub mod pipeline;
pub mod worker;
