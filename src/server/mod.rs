//! Configuration pipeline server side: merging, watching, compiling.

pub mod merge;
pub mod router_factory;
pub mod watcher;
