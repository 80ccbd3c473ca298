//! Schema catalog for Strata.
//!
//! Describes tables, columns, constraints and indexes, and the [`Model`] that
//! groups them.

mod column;
mod constraint;
mod index;
mod model;
mod table;
mod types;

pub use column::Column;
pub use constraint::{Constraint, ConstraintKind, ReferentialAction};
pub use index::Index;
pub use model::Model;
pub use table::Table;
pub use types::ColumnType;
