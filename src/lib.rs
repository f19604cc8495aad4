//! Client-side foundation for the museum portal: an HTTP transport with auth
//! recovery, a query cache with stale-while-revalidate and offline sync, a
//! durable key-value store it persists into, and typed query/mutation hooks.

pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod hooks;
pub mod logging;
pub mod storage;
pub mod transport;

pub use context::AppContext;
