use log::info;
use std::ops::Deref;
use std::sync::{Arc, RwLock};

/// An immutable value tagged with the generation it was published as.
#[derive(Debug)]
pub struct Snapshot<T> {
    pub generation: u64,
    value: T,
}

impl<T> Deref for Snapshot<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

/// Holds the current snapshot of a shared, read-mostly value.
///
/// Readers clone the `Arc` once per request and keep using it even if a newer
/// generation is published meanwhile. Publishing swaps the whole value.
#[derive(Debug)]
pub struct SnapshotStore<T> {
    label: &'static str,
    current: RwLock<Arc<Snapshot<T>>>,
}

impl<T> SnapshotStore<T> {
    pub fn new(label: &'static str, value: T) -> Self {
        Self {
            label,
            current: RwLock::new(Arc::new(Snapshot {
                generation: 1,
                value,
            })),
        }
    }

    pub fn current(&self) -> Arc<Snapshot<T>> {
        // a poisoned lock still guards a fully published Arc
        let guard = match self.current.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(&guard)
    }

    /// Replaces the current value and returns the new generation.
    pub fn publish(&self, value: T) -> u64 {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let generation = guard.generation + 1;
        *guard = Arc::new(Snapshot { generation, value });
        info!("Published {} snapshot generation {}", self.label, generation);
        generation
    }
}
