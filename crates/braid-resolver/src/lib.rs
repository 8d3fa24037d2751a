mod error;
mod resolver;

pub use error::ResolveError;
pub use resolver::{InputResolver, Resolution, ResolveRequest, StandardResolver, lookup_path};
