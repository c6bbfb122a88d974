//! The event surface management layers listen on.
//!
//! No failure unwinds through here: sync trouble arrives as a
//! [`Event::SyncFinish`] with a status label.

use std::sync::{Arc, RwLock};

use tracing::*;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Event {
    SyncStart {
        sync: String,
        local_tree: String,
        remote_tree: String,
    },
    SyncFinish {
        sync: String,
        local_tree: String,
        remote_tree: String,
        /// `"ok"` or an [`Error::category`](crate::errors::Error::category).
        status: String,
    },
    IndexStart {
        tree: String,
    },
    IndexFinish {
        tree: String,
    },
    /// Metadata changed underneath a UI; time to refresh.
    SyncModify,
    DownloadFileNumber(u32),
}

pub trait EventListener: Send + Sync {
    fn notify(&self, event: &Event);
}

/// Fan-out to registered listeners. Clones share the registry.
#[derive(Clone, Default)]
pub struct Notifier {
    listeners: Arc<RwLock<Vec<Arc<dyn EventListener>>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().unwrap().push(listener);
    }

    pub fn emit(&self, event: Event) {
        trace!("event: {event:?}");
        let listeners = self.listeners.read().unwrap();
        for l in listeners.iter() {
            l.notify(&event);
        }
    }
}
