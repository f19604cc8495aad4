//! Typed query and mutation call sites built on the transport client and the
//! cache manager.

mod mutation;
mod query;

pub use mutation::Mutation;
pub use query::{Query, QueryOptions, QueryState};
