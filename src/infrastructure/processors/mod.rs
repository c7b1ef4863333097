// Processors module
pub mod asset_processor;
pub mod code_splitter;
pub mod css_processor;
pub mod dependency_scanner;
pub mod js_processor;
pub mod minifier;
pub mod scss_processor;
pub mod typescript_processor;

pub use asset_processor::*;
pub use code_splitter::*;
pub use css_processor::*;
pub use dependency_scanner::*;
pub use js_processor::*;
pub use minifier::*;
pub use scss_processor::*;
pub use typescript_processor::*;
