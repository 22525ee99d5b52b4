//! Notifications emitted after administrative operations.
//!
//! Sinks are invoked after the store lock is released and cannot fail the
//! operation that triggered them.

use crate::engine::{IndexType, SoupFeature};

/// An administrative event raised by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    SoupRegistered {
        soup_name: String,
        features: Vec<SoupFeature>,
        index_types: Vec<IndexType>,
    },
    SoupAltered {
        soup_name: String,
        features: Vec<SoupFeature>,
        index_types: Vec<IndexType>,
        re_index_data: bool,
    },
    SoupDropped {
        soup_name: String,
    },
}

/// Receives [`StoreEvent`]s.
pub trait StoreEventSink: Send + Sync {
    fn on_event(&self, event: &StoreEvent);
}

/// Default sink that writes events to the log.
#[derive(Debug, Default)]
pub struct LogEventSink;

impl StoreEventSink for LogEventSink {
    fn on_event(&self, event: &StoreEvent) {
        log::info!("store event: {:?}", event);
    }
}
