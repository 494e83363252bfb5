//! Parameter-bound SQL statement builders for relmodel.
//!
//! The session crate issues every statement through these builders, so
//! entity data only ever reaches the database as bound parameters.

pub mod builder;
pub mod expr;

pub use builder::{DeleteBuilder, InsertBuilder, Select, UpdateBuilder};
pub use expr::{Direction, Filter, OrderBy, bind_markers};
pub use relmodel_core::Dialect;

