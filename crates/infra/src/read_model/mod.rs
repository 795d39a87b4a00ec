//! Read-model entity storage.
//!
//! [`EntityStore`] is the object-safe, JSON-level contract backends implement;
//! [`EntityStoreExt`] layers the typed `load_item` / `insert_item` / ... API for
//! [`Entity`](eventline_core::Entity) types on top of any store.

pub mod entity_store;

pub use entity_store::{EntityStore, EntityStoreError, EntityStoreExt, InMemoryEntityStore, JsonPredicate};
