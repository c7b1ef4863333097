//! Soku bundler core: module resolution, a parallel module graph, a cached
//! transform pipeline, chunk planning and atomic emission.

pub mod core;
pub mod infrastructure;
pub mod utils;

pub use crate::core::{
    build, BuildConfig, BuildResult, BuildService, Bundler, EntryPoint, Manifest,
    SokuBuildService, SplitConfig, TransformStep, TransformStepKind,
};
pub use crate::utils::{Result, SokuError};
