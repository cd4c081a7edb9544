//! Core data model: markers, the tree that stores them and the documents
//! they are anchored to
//!
//! This module contains pure data structures with minimal external dependencies.

pub mod document;
pub mod edit;
pub mod lazy_marker;
pub mod marker;
pub mod marker_iter;
pub mod marker_tree;
