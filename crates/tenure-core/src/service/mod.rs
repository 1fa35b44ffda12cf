//! Application services built on top of the repository traits.

pub mod definition;
