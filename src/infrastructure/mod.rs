// Infrastructure layer
pub mod cache;
pub mod emitter;
pub mod node_resolver;
pub mod processors;

pub use cache::*;
pub use emitter::*;
pub use node_resolver::*;
pub use processors::*;
