pub mod buffer;
pub mod dedup;
pub mod fingerprint;
pub mod health;
pub mod metrics;
pub mod point;
pub mod query;
pub mod sink;
pub mod source;
pub mod test_utils;
