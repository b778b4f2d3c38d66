#[cfg(feature = "streamload-base")]
pub use streamload_base as base;

#[cfg(feature = "streamload-loader")]
pub use streamload_loader as loader;
