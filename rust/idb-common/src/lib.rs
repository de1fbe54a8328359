#![warn(missing_docs)]

//! Light weight helpers shared across the engine crates. Their chief quality
//! is that they have virtually zero dependencies.

mod scheduler;
pub use scheduler::*;
