//! Event bank: immutable binary blob holding the sound-selection graphs
//!
//! - [`format`]: layout constants and decoded record types
//! - [`Bank`]: validated zero-copy reader
//! - [`BankBuilder`]: writer for tests and tooling

mod builder;
pub mod format;
mod reader;

pub use builder::{BankBuilder, NodeRef};
pub use format::*;
pub use reader::{Bank, NodeList};
