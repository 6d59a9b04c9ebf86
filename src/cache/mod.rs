//! In-memory caching primitives

mod bounded;

pub use bounded::BoundedMap;
