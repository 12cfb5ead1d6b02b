//! Message records and query inputs.

mod message;

pub use message::{FtsFilter, InsertMessage, StoredMessage, VectorMatch};
