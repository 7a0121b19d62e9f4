/// Remote message store access: transport, typed query builder, wire rows
pub mod http;
pub mod query;
pub mod schema;

pub use http::{HttpTransport, Remote, Transport};
pub use query::{Cond, Op, Order, Query};
