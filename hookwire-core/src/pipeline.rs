// ABOUTME: Ingest pipeline: append to the event store, then hand new events to the dispatcher
// ABOUTME: Serializes append+dispatch so dispatch order matches stored_at order across tenants

use anyhow::Result;
use std::sync::{Arc, Mutex};

use crate::dispatcher::TriggerDispatcher;
use crate::event::IngestedEvent;
use crate::event_store::{AppendOutcome, EventStore};

pub struct EventPipeline {
    store: EventStore,
    dispatcher: Option<Arc<TriggerDispatcher>>,
    order: Mutex<()>,
}

impl EventPipeline {
    pub fn new(store: EventStore, dispatcher: Arc<TriggerDispatcher>) -> Self {
        Self {
            store,
            dispatcher: Some(dispatcher),
            order: Mutex::new(()),
        }
    }

    /// Pipeline that only stores events
    pub fn store_only(store: EventStore) -> Self {
        Self {
            store,
            dispatcher: None,
            order: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    /// Store one event and, if it was new, dispatch it to triggers.
    ///
    /// Dispatch errors are logged and do not fail the ingest: the event is
    /// already durable and the cursor may advance past it.
    pub fn ingest(&self, tenant_id: &str, event: &IngestedEvent) -> Result<AppendOutcome> {
        let _order = self
            .order
            .lock()
            .map_err(|e| anyhow::anyhow!("Pipeline order lock poisoned: {}", e))?;

        let outcome = self.store.append(tenant_id, event)?;
        if !outcome.stored {
            return Ok(outcome);
        }

        if let Some(dispatcher) = &self.dispatcher {
            if let Err(e) = dispatcher.process(&outcome.event) {
                tracing::error!(
                    tenant = %tenant_id,
                    event_id = %outcome.event.event_id,
                    error = %e,
                    "Trigger dispatch failed"
                );
            }
        }
        Ok(outcome)
    }
}
