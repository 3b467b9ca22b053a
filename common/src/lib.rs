//! simplebank Common Types
//!
//! Identifier and currency types shared by the ledger engine and its
//! consumers.

pub mod identifiers;
pub mod currency;
pub mod error;

pub use identifiers::*;
pub use currency::*;
pub use error::*;
