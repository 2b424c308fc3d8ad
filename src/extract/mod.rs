//! Everything that turns a stored descriptor into structured data: text,
//! identity, model sections, unit heuristics, normalization and validation.

pub mod catalog;
pub mod identity;
pub mod normalize;
pub mod resolve;
pub mod schema;
pub mod sections;
pub mod text;
pub mod units;
