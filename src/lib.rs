// Range marker library - exposes all core modules for testing

pub mod config;
pub mod error;
pub mod model;
pub mod services;

pub use config::{ConfigError, MarkerTreeConfig};
pub use error::{MarkerError, Result};
pub use model::document::{Document, TextBuffer};
pub use model::edit::DocumentChange;
pub use model::lazy_marker::{
    DocumentLoader, DocumentRegistry, FileLoader, LazyMarker, LazyPosition, SharedDocument,
};
pub use model::marker::{
    apply_change, Affinity, MarkerId, MarkerOptions, Taste, TasteSet, TextRange, MAX_TASTES,
};
pub use model::marker_iter::OverlappingIter;
pub use model::marker_tree::MarkerTree;
