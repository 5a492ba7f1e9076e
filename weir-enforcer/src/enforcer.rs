use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use weir_core::bus::{node_routing_key, MessageBus};
use weir_core::catalog::Catalog;
use weir_metrics::{DeliveryError, RawBatch, RawBatchObserver};

use crate::strategy::AllocationStrategy;

/// Static configuration of one enforcement loop.
#[derive(Debug, Clone)]
pub struct EnforcerConfig {
    /// Name the loop attaches to its metric hub under.
    pub name: String,
    /// Request method label carried in every change record.
    pub method: String,
    /// SLO family read from the catalog each tick.
    pub slo: String,
    /// Exchange change records are published on.
    pub exchange: String,
}

#[derive(Default)]
struct LoopState {
    /// Integer-rounded values from the previous tick, keyed on
    /// `(account, location)`.
    last: HashMap<(String, String), i64>,
    last_update: Option<Instant>,
}

/// Receives each hub tick's raw batch, runs the allocation strategy and
/// publishes one change record per flow whose rounded value moved.
pub struct EnforcementLoop {
    config: EnforcerConfig,
    strategy: Box<dyn AllocationStrategy>,
    catalog: Catalog,
    bus: MessageBus,
    state: Mutex<LoopState>,
}

impl EnforcementLoop {
    pub fn new(
        config: EnforcerConfig,
        strategy: Box<dyn AllocationStrategy>,
        catalog: Catalog,
        bus: MessageBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            strategy,
            catalog,
            bus,
            state: Mutex::new(LoopState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Diffs the new assignment against the previous one. Past the reset
    /// window the previous assignment is forgotten first, so every flow is
    /// republished.
    fn changed_records(&self, batch: &RawBatch, now: Instant) -> Vec<(String, String)> {
        let slos = self.catalog.slo_budgets(&self.config.slo);
        let assignment = self.strategy.compute(batch, &slos);

        let mut state = self.state.lock();
        let stale = state
            .last_update
            .map_or(true, |at| now.duration_since(at) > self.strategy.reset_window());
        if stale {
            state.last.clear();
        }

        let mut records = Vec::new();
        let mut next = HashMap::with_capacity(assignment.len());
        for ((account, location), share) in assignment.iter() {
            let value = share.value.round() as i64;
            if state.last.get(&(account.clone(), location.clone())) != Some(&value) {
                records.push((
                    node_routing_key(location),
                    format!(
                        "{}/{}/{}/{}/{}/{}",
                        location, account, self.config.method, share.device, share.policy, value
                    ),
                ));
            }
            next.insert((account.clone(), location.clone()), value);
        }
        state.last = next;
        state.last_update = Some(now);
        records
    }
}

#[async_trait]
impl RawBatchObserver for EnforcementLoop {
    async fn on_raw_batch(&self, metric: &str, batch: RawBatch) -> Result<(), DeliveryError> {
        let records = self.changed_records(&batch, Instant::now());
        if records.is_empty() {
            debug!(loop_name = %self.config.name, %metric, "assignment unchanged");
            return Ok(());
        }

        for (routing_key, record) in records {
            if let Err(err) = self
                .bus
                .publish(&self.config.exchange, &routing_key, record)
                .await
            {
                warn!(loop_name = %self.config.name, %routing_key, %err, "change record publish failed");
            }
        }
        Ok(())
    }
}
