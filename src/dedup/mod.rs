//! The two chunking pipelines (§4.4 dynamic, §4.5 fixed) that sit behind
//! a writer session once it's established.

pub mod dynamic;
pub mod fixed;

pub use dynamic::DynamicAssembler;
