//! Push-style invalidation between the caches and the views.
//!
//! Resource caches emit events when something becomes available or stale;
//! views subscribe and flip their redraw/resolve flags. Callbacks run on the
//! emitting thread (often a decode worker), so they must only touch atomics
//! or short critical sections. Events are also queued for `poll()` by hosts
//! that prefer batch processing in their main loop.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use log::warn;
use uuid::Uuid;

use super::frame_cache::FrameCacheKey;

/// Maximum events in queue before oldest are evicted
const MAX_QUEUE_SIZE: usize = 1000;

/// A decode buffer finished loading (successfully or not).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferReady {
    pub key: FrameCacheKey,
    pub ok: bool,
}

/// All cached data of a source was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceInvalidated {
    pub source_id: Uuid,
}

/// A track view installed a new stripe solution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolutionInstalled {
    pub track_index: i32,
    pub revision: u64,
}

/// Marker trait for events.
pub trait Event: Any + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync + 'static> Event for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

type Callback = Arc<dyn Fn(&dyn Any) + Send + Sync>;

pub type BoxedEvent = Box<dyn Event>;

/// Typed pub/sub with an optional deferred queue.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<RwLock<HashMap<TypeId, Vec<Callback>>>>,
    queue: Arc<Mutex<Vec<BoxedEvent>>>,
    queue_events: bool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("queue_events", &self.queue_events)
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Bus that only invokes callbacks.
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            queue: Arc::new(Mutex::new(Vec::new())),
            queue_events: false,
        }
    }

    /// Bus that also keeps emitted events for [`poll`](Self::poll).
    pub fn with_queue() -> Self {
        Self { queue_events: true, ..Self::new() }
    }

    /// Subscribe to events of type E. Callbacks fire in subscription order.
    pub fn subscribe<E, F>(&self, callback: F)
    where
        E: Event,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let wrapped: Callback = Arc::new(move |any: &dyn Any| {
            if let Some(event) = any.downcast_ref::<E>() {
                callback(event);
            }
        });
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(TypeId::of::<E>())
            .or_default()
            .push(wrapped);
    }

    pub fn emit<E: Event>(&self, event: E) {
        // clone the list so callbacks may subscribe without deadlocking
        let callbacks: Vec<Callback> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&TypeId::of::<E>())
            .cloned()
            .unwrap_or_default();
        for cb in &callbacks {
            cb(&event);
        }

        if !self.queue_events {
            return;
        }
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= MAX_QUEUE_SIZE {
            let evict_count = queue.len() / 2;
            warn!("EventBus queue full ({} events), evicting oldest {}", queue.len(), evict_count);
            queue.drain(0..evict_count);
        }
        queue.push(Box::new(event));
    }

    /// Take every queued event.
    pub fn poll(&self) -> Vec<BoxedEvent> {
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn has_subscribers<E: Event>(&self) -> bool {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&TypeId::of::<E>())
            .is_some_and(|v| !v.is_empty())
    }
}

/// Downcast a polled event.
pub fn downcast_event<E: Event>(event: &BoxedEvent) -> Option<&E> {
    (**event).as_any().downcast_ref::<E>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_subscribe_and_emit() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.subscribe::<SourceInvalidated, _>(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(bus.has_subscribers::<SourceInvalidated>());
        assert!(!bus.has_subscribers::<BufferReady>());

        bus.emit(SourceInvalidated { source_id: Uuid::new_v4() });
        bus.emit(SolutionInstalled { track_index: 0, revision: 1 });
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // no queue by default
        assert!(bus.poll().is_empty());
    }

    #[test]
    fn test_queue_and_downcast() {
        let bus = EventBus::with_queue();
        let id = Uuid::new_v4();
        bus.emit(SourceInvalidated { source_id: id });
        bus.emit(SolutionInstalled { track_index: 2, revision: 9 });

        let events = bus.poll();
        assert_eq!(events.len(), 2);
        assert_eq!(downcast_event::<SourceInvalidated>(&events[0]).map(|e| e.source_id), Some(id));
        assert!(downcast_event::<SourceInvalidated>(&events[1]).is_none());
        assert!(bus.poll().is_empty());
    }
}
