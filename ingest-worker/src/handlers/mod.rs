mod app;
mod ingest;
mod points;
mod query;

pub use app::{app, AppState};
