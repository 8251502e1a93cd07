pub mod graph;
pub mod loader;
pub mod registry;
pub mod resolved;
pub mod types;
pub mod validator;

pub use graph::*;
pub use loader::*;
pub use registry::*;
pub use resolved::*;
pub use types::*;
pub use validator::is_identifier;
