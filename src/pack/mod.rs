pub mod archive;
pub mod dex_mode;
pub mod metadata;
pub mod module;
pub mod native_libs;
pub mod orchestrator;
pub mod xz;
pub mod zip_patch;
