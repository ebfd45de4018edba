//! Core abstractions shared by the drivers and the dump engine.
//!
//! - [`value`]: column metadata and row values
//! - [`traits`]: connector, session, and cursor traits
//! - [`identifier`]: identifier validation and quoting

pub mod identifier;
pub mod traits;
pub mod value;

// Re-export commonly used types for convenience
pub use traits::{Connector, RowCursor, Session};
pub use value::{Field, FieldKind, SqlValue, TableRef};
