//! Page-oriented B+ tree: node codec, split/merge engines, and the
//! copy-on-write insert/delete pipelines.

mod merge;
pub mod node;
mod split;
mod tree;

#[cfg(test)]
mod tests;

pub use tree::BTree;
