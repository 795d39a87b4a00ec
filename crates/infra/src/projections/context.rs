use std::sync::atomic::{AtomicBool, Ordering};

/// Processing mode shared by a projector and its projection.
///
/// Live processing is real-time event delivery; replay is historical catch-up,
/// during which no live-update notifications are emitted.
#[derive(Debug)]
pub struct ProjectionContext {
    live: AtomicBool,
}

impl Default for ProjectionContext {
    fn default() -> Self {
        Self {
            live: AtomicBool::new(true),
        }
    }
}

impl ProjectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_live_processing(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn set_live_processing(&self, live: bool) {
        self.live.store(live, Ordering::SeqCst);
    }
}

/// A read entity as loaded for one event, plus whether it already exists in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDescriptor<T> {
    pub id: String,
    pub entity: T,
    pub is_new: bool,
}

impl<T> EntityDescriptor<T> {
    pub fn existing(id: impl Into<String>, entity: T) -> Self {
        Self {
            id: id.into(),
            entity,
            is_new: false,
        }
    }

    pub fn created(id: impl Into<String>, entity: T) -> Self {
        Self {
            id: id.into(),
            entity,
            is_new: true,
        }
    }
}
