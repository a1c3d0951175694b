//! Concurrency primitives shared across components
pub mod bytepool;
pub mod spinner;

pub use bytepool::BytePool;
pub use spinner::{SpinPriority, Spinner};
