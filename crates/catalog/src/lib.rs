//! Product/category catalog boundary.
//!
//! The count engine treats the catalog as an external collaborator: it is
//! consulted exactly once per count, at creation time, to snapshot system
//! quantities and unit costs. Live catalog changes after that never leak
//! into an open count.

pub mod catalog;

pub use catalog::{
    CatalogError, CategoryId, InMemoryCatalog, ProductCatalog, ProductId, ProductSnapshot,
};
