//! Missing key policy
//!
//! Decides the disposition of recipients for which no usable encryption
//! key exists.

mod engine;

pub use engine::{MissingKeyPolicy, PolicyRule};
