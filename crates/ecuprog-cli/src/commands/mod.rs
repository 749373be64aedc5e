//! Command implementations for ecuprog

pub mod checksum;
pub mod coding;
pub mod simulate;

pub use checksum::{checksum, sign, verify};
pub use coding::{coding, FieldSpec};
pub use simulate::{simulate, SimulateArgs};
