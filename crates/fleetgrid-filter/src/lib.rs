//! fleetgrid-filter: the target filter expression language.
//!
//! Expressions are parsed against a closed [`Schema`] into a [`Predicate`].
//! Predicates have a canonical text form ([`Display`](std::fmt::Display))
//! that re-parses to an equal value, compile into a [`CompiledFilter`] for
//! evaluation, and plan into a [`TargetQuery`] that narrows the store scan
//! by controller-id key range when it can.
//!
//! ```text
//! updateStatus==ERROR;(attribute.region==eu*,name=in=(gw-1,gw-2))
//! not updateLocked==true and createdAt>=1700000000
//! ```

pub mod compiled;
pub mod engine;
pub mod error;
mod lexer;
pub mod parser;
pub mod predicate;
pub mod query;
pub mod schema;

pub use compiled::CompiledFilter;
pub use engine::FilterEngine;
pub use error::{FilterError, FilterResult};
pub use parser::parse;
pub use predicate::{Comparison, Literal, Operator, Predicate};
pub use query::TargetQuery;
pub use schema::{Field, FieldValue, Filterable, Schema, ValueType};
