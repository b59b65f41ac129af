//! # class-repo
//!
//! Reads Java class files and keeps a class-loader-aware repository of them for a
//! bytecode-instrumenting profiler.
//!
//! ## Architecture
//!
//! - **reader**: single-pass class file parser producing a [`record::ClassRecord`]
//! - **record**: offset-based class view with lazily decoded line number tables
//! - **layout**: sub-offsets (code, tables, stack map) inside one method_info
//! - **stackmap**: `StackMapTable` decoding and patching after bytecode insertion
//! - **dynamic**: per-method instrumentation state, replaced bodies, hierarchy links
//! - **registry**: name to class map resolved per class loader, placeholders, source regions
//! - **cache**: LRU byte cache for disk classes and the VM-supplied byte cache
//! - **classpath**: class path directories and archives with pooled archive handles
//! - **loader**: class loader parent table
//! - **client**: the two calls this crate makes into the target VM connection
//! - **config**: per-session settings
//! - **opcodes**: class file constants

pub mod cache;
pub mod classpath;
pub mod client;
pub mod config;
pub mod dynamic;
pub mod error;
pub mod layout;
pub mod loader;
pub mod opcodes;
pub mod reader;
pub mod record;
pub mod registry;
pub mod stackmap;

#[cfg(test)]
mod testing;

pub use client::TargetClient;
pub use config::SessionConfig;
pub use dynamic::{DynamicClass, MethodStatus};
pub use error::{ClassError, Result, TargetTerminated};
pub use loader::{LoaderId, NO_LOADER, ROOT_LOADER};
pub use record::ClassRecord;
pub use registry::{ClassEntry, ClassRegistry, CodeRegion};
