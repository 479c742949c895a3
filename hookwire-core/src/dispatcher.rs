// ABOUTME: Trigger dispatcher: matches stored events against active triggers and fires actions
// ABOUTME: Matching is synchronous; execution runs on one queue worker per trigger, in match order

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::event::StoredEvent;
use crate::event_store::EventStore;
use crate::filter::{evaluate, CompiledFilter, Filter};
use crate::metrics;
use crate::trigger::{ResolvedAction, Trigger, TriggerStore};

/// Largest sample a backtest will read from the event store.
pub const MAX_BACKTEST_SAMPLE: usize = 500;

/// Downstream collaborator that actually performs a resolved action
/// (wakes an agent, sends a message, runs a command).
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &ResolvedAction) -> Result<()>;
}

/// Matches events against triggers and hands matches to the executor.
pub struct TriggerDispatcher {
    triggers: TriggerStore,
    events: EventStore,
    executor: Arc<dyn ActionExecutor>,
    /// Compiled filters keyed by trigger id, recompiled when the filter changes
    compiled: Mutex<HashMap<String, (Filter, CompiledFilter)>>,
    /// Execution queue per trigger. Each is drained by a single worker task so
    /// one trigger's actions execute in the order they were matched.
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<ResolvedAction>>>,
}

impl TriggerDispatcher {
    pub fn new(triggers: TriggerStore, events: EventStore, executor: Arc<dyn ActionExecutor>) -> Self {
        Self {
            triggers,
            events,
            executor,
            compiled: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn triggers(&self) -> &TriggerStore {
        &self.triggers
    }

    /// Evaluate one stored event against every active trigger.
    ///
    /// Each match bumps the trigger's counters and queues the resolved action
    /// without waiting for it. Returns the actions handed off, in trigger order.
    /// Must be called from within a tokio runtime.
    pub fn process(&self, event: &StoredEvent) -> Result<Vec<ResolvedAction>> {
        let active = self.triggers.list_active()?;
        let mut fired = Vec::new();

        for trigger in active.iter().filter(|t| t.is_active()) {
            if !self.matches(trigger, event) {
                continue;
            }

            let now = Utc::now();
            let resolved = ResolvedAction {
                trigger_id: trigger.id.clone(),
                trigger_name: trigger.name.clone(),
                agent_id: trigger.agent_id.clone(),
                tenant_id: event.tenant_id.clone(),
                event_id: event.event_id.clone(),
                action: trigger.action.resolve(event),
                resolved_at: now,
            };

            if let Err(e) = self.triggers.record_fire(&trigger.id, now) {
                tracing::warn!(
                    trigger_id = %trigger.id,
                    error = %e,
                    "Failed to record trigger fire"
                );
            }
            metrics::record_trigger_fired(trigger.action.kind());
            tracing::info!(
                trigger_id = %trigger.id,
                agent_id = %trigger.agent_id,
                event_id = %event.event_id,
                action = trigger.action.kind(),
                "Trigger matched, dispatching action"
            );

            self.enqueue(resolved.clone());
            fired.push(resolved);
        }

        self.forget_deleted(&active);
        Ok(fired)
    }

    fn matches(&self, trigger: &Trigger, event: &StoredEvent) -> bool {
        let mut cache = match self.compiled.lock() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };
        let fresh = matches!(cache.get(&trigger.id), Some((filter, _)) if *filter == trigger.filter);
        if !fresh {
            match trigger.filter.compile() {
                Ok(compiled) => {
                    cache.insert(trigger.id.clone(), (trigger.filter.clone(), compiled));
                }
                Err(e) => {
                    tracing::warn!(
                        trigger_id = %trigger.id,
                        error = %e,
                        "Skipping trigger with invalid filter"
                    );
                    return false;
                }
            }
        }
        cache
            .get(&trigger.id)
            .map(|(_, compiled)| compiled.matches(event))
            .unwrap_or(false)
    }

    fn forget_deleted(&self, active: &[Trigger]) {
        let is_active = |id: &String| active.iter().any(|t| &t.id == id);
        if let Ok(mut cache) = self.compiled.lock() {
            if cache.len() > active.len() {
                cache.retain(|id, _| is_active(id));
            }
        }
        // Dropping a sender lets its worker finish the backlog and exit
        if let Ok(mut queues) = self.queues.lock() {
            if queues.len() > active.len() {
                queues.retain(|id, _| is_active(id));
            }
        }
    }

    /// Hand an action to its trigger's queue, starting the worker on first use
    /// or after the previous worker exited.
    fn enqueue(&self, action: ResolvedAction) {
        let mut queues = match self.queues.lock() {
            Ok(queues) => queues,
            Err(poisoned) => poisoned.into_inner(),
        };

        let trigger_id = action.trigger_id.clone();
        let action = match queues.get(&trigger_id) {
            Some(sender) => match sender.send(action) {
                Ok(()) => return,
                Err(mpsc::error::SendError(action)) => action,
            },
            None => action,
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(drain_queue(
            Arc::clone(&self.executor),
            trigger_id.clone(),
            receiver,
        ));
        // The receiver is alive in the worker just spawned
        let _ = sender.send(action);
        queues.insert(trigger_id, sender);
    }

    /// Run `filter` over the most recent `sample_size` stored events.
    /// Read-only: no counters are touched and nothing is executed.
    pub fn backtest(&self, filter: &Filter, sample_size: usize) -> Result<Vec<StoredEvent>> {
        let sample = self.events.recent(sample_size.min(MAX_BACKTEST_SAMPLE))?;
        evaluate(filter, &sample)
    }
}

/// Execute one trigger's actions strictly in arrival order. A failed action is
/// counted and logged; the queue moves on.
async fn drain_queue(
    executor: Arc<dyn ActionExecutor>,
    trigger_id: String,
    mut receiver: mpsc::UnboundedReceiver<ResolvedAction>,
) {
    while let Some(action) = receiver.recv().await {
        if let Err(e) = executor.execute(&action).await {
            metrics::record_action_failure();
            tracing::error!(
                trigger_id = %action.trigger_id,
                event_id = %action.event_id,
                error = %e,
                "Trigger action execution failed"
            );
        }
    }
    tracing::debug!(trigger_id = %trigger_id, "Trigger execution queue closed");
}

/// Executor that only logs actions. Used when no downstream is configured.
pub struct LogExecutor;

#[async_trait]
impl ActionExecutor for LogExecutor {
    async fn execute(&self, action: &ResolvedAction) -> Result<()> {
        tracing::info!(
            trigger_id = %action.trigger_id,
            agent_id = %action.agent_id,
            tenant = %action.tenant_id,
            action = %serde_json::to_string(&action.action)?,
            "Resolved trigger action (no executor configured)"
        );
        Ok(())
    }
}
