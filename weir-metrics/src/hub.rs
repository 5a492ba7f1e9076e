use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use weir_core::bus::{Binding, Delivery, MessageBus};
use weir_core::runtime::{Mailbox, Stoppable};

use crate::batch::{MetricPayload, RawBatch, Window};
use crate::error::{DeliveryError, HubError};

/// Receives the per-tenant aggregated scalar each tick.
///
/// Implementations must hand the value off without blocking the hub, e.g.
/// by sending into their own mailbox; any heavy work happens on the
/// subscriber's side.
#[async_trait]
pub trait MetricSubscriber: Send + Sync {
    async fn update(&self, metric: &str, tenant: &str, value: f64) -> Result<(), DeliveryError>;
}

/// Receives the full unaggregated batch each tick. At most one raw
/// observer exists per hub.
#[async_trait]
pub trait RawBatchObserver: Send + Sync {
    async fn on_raw_batch(&self, metric: &str, batch: RawBatch) -> Result<(), DeliveryError>;
}

/// Which of the hub's two channels an attachment wants.
#[derive(Clone)]
pub enum SubscriberChannel {
    Aggregated(Arc<dyn MetricSubscriber>),
    Raw(Arc<dyn RawBatchObserver>),
}

/// Per-hub configuration: the signal name, the aggregation window and the
/// transport binding payloads are consumed from.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub metric: String,
    pub period: Duration,
    pub binding: Binding,
}

/// Snapshot of a hub's subscriber index, used by diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubInfo {
    pub metric: String,
    pub aggregated_subscribers: usize,
    pub has_raw_observer: bool,
}

enum HubCommand {
    Attach {
        subscriber_id: String,
        tenant: String,
        policy: String,
        channel: SubscriberChannel,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    Detach {
        subscriber_id: String,
        tenant: String,
    },
    Notify {
        body: String,
    },
    /// Forces an aggregation tick outside the timer schedule. Used by
    /// shutdown flushes and tests.
    Flush {
        reply: oneshot::Sender<()>,
    },
    Info {
        reply: oneshot::Sender<HubInfo>,
    },
    Stop,
}

/// Handle to a running metric hub.
#[derive(Clone)]
pub struct HubHandle {
    metric: String,
    mailbox: Mailbox<HubCommand>,
}

impl HubHandle {
    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// Registers interest in the hub's output. Idempotent per
    /// `(tenant, subscriber_id)`; a second raw observer is rejected.
    pub async fn attach(
        &self,
        subscriber_id: &str,
        tenant: &str,
        policy: &str,
        channel: SubscriberChannel,
    ) -> Result<(), HubError> {
        self.mailbox
            .ask(|reply| HubCommand::Attach {
                subscriber_id: subscriber_id.to_string(),
                tenant: tenant.to_string(),
                policy: policy.to_string(),
                channel,
                reply,
            })
            .await
            .map_err(|_| HubError::Stopped)?
    }

    /// Removes a registration. A no-op when absent; never raises.
    pub fn detach(&self, subscriber_id: &str, tenant: &str) {
        let _ = self.mailbox.send(HubCommand::Detach {
            subscriber_id: subscriber_id.to_string(),
            tenant: tenant.to_string(),
        });
    }

    /// Feeds a raw transport payload into the current window, bypassing
    /// the bus consumer. Malformed payloads are dropped by the hub.
    pub fn notify(&self, body: impl Into<String>) {
        let _ = self.mailbox.send(HubCommand::Notify { body: body.into() });
    }

    /// Runs an aggregation tick now and waits for its deliveries.
    pub async fn flush(&self) -> Result<(), HubError> {
        self.mailbox
            .ask(|reply| HubCommand::Flush { reply })
            .await
            .map_err(|_| HubError::Stopped)
    }

    pub async fn info(&self) -> Result<HubInfo, HubError> {
        self.mailbox
            .ask(|reply| HubCommand::Info { reply })
            .await
            .map_err(|_| HubError::Stopped)
    }
}

#[async_trait]
impl Stoppable for HubHandle {
    async fn stop(&self) {
        let _ = self.mailbox.send(HubCommand::Stop);
    }
}

struct HubState {
    metric: String,
    window: Window,
    aggregated: HashMap<(String, String), HashMap<String, Arc<dyn MetricSubscriber>>>,
    raw: Option<(String, Arc<dyn RawBatchObserver>)>,
}

/// One actor per monitored signal: ingests transport payloads, aggregates
/// them over a fixed window and fans results out to subscribers.
pub struct MetricHub;

impl MetricHub {
    /// Binds the hub's transport queue and starts the actor loop.
    pub async fn spawn(config: HubConfig, bus: &MessageBus) -> HubHandle {
        let deliveries = bus.consume(config.binding.clone()).await;
        Self::spawn_with_deliveries(config, Some(deliveries))
    }

    fn spawn_with_deliveries(
        config: HubConfig,
        deliveries: Option<mpsc::UnboundedReceiver<Delivery>>,
    ) -> HubHandle {
        let (mailbox, mut commands) = Mailbox::channel();
        let handle = HubHandle {
            metric: config.metric.clone(),
            mailbox,
        };

        tokio::spawn(async move {
            let mut state = HubState {
                metric: config.metric.clone(),
                window: Window::default(),
                aggregated: HashMap::new(),
                raw: None,
            };
            let mut transport = deliveries;
            let mut ticker = tokio::time::interval(config.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first interval tick completes immediately; consume it so
            // the first window spans a full period.
            ticker.tick().await;

            info!(metric = %state.metric, period_ms = config.period.as_millis() as u64, "metric hub started");

            loop {
                tokio::select! {
                    maybe_cmd = commands.recv() => match maybe_cmd {
                        Some(HubCommand::Attach { subscriber_id, tenant, policy, channel, reply }) => {
                            let result = state.attach(subscriber_id, tenant, policy, channel);
                            let _ = reply.send(result);
                        }
                        Some(HubCommand::Detach { subscriber_id, tenant }) => {
                            state.detach(&subscriber_id, &tenant);
                        }
                        Some(HubCommand::Notify { body }) => state.ingest(&body),
                        Some(HubCommand::Flush { reply }) => {
                            state.tick().await;
                            let _ = reply.send(());
                        }
                        Some(HubCommand::Info { reply }) => {
                            let _ = reply.send(state.info());
                        }
                        Some(HubCommand::Stop) | None => break,
                    },
                    maybe_delivery = recv_transport(&mut transport) => match maybe_delivery {
                        Some(delivery) => state.ingest(&delivery.body),
                        None => {
                            debug!(metric = %state.metric, "transport consumer closed");
                            transport = None;
                        }
                    },
                    _ = ticker.tick() => state.tick().await,
                }
            }

            info!(metric = %state.metric, "metric hub stopped");
        });

        handle
    }
}

async fn recv_transport(
    transport: &mut Option<mpsc::UnboundedReceiver<Delivery>>,
) -> Option<Delivery> {
    match transport.as_mut() {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

impl HubState {
    fn attach(
        &mut self,
        subscriber_id: String,
        tenant: String,
        policy: String,
        channel: SubscriberChannel,
    ) -> Result<(), HubError> {
        match channel {
            SubscriberChannel::Aggregated(subscriber) => {
                // A subscriber holds at most one slot per tenant;
                // re-attaching under another policy moves the slot.
                for ((bucket_tenant, _), subscribers) in self.aggregated.iter_mut() {
                    if *bucket_tenant == tenant {
                        subscribers.remove(&subscriber_id);
                    }
                }
                self.aggregated.retain(|_, subscribers| !subscribers.is_empty());
                let bucket = self.aggregated.entry((tenant, policy)).or_default();
                bucket.insert(subscriber_id, subscriber);
                Ok(())
            }
            SubscriberChannel::Raw(observer) => match &self.raw {
                Some((existing, _)) if *existing != subscriber_id => {
                    warn!(
                        metric = %self.metric,
                        existing = %existing,
                        rejected = %subscriber_id,
                        "raw observer slot already taken"
                    );
                    Err(HubError::Subscription(format!(
                        "raw observer slot on '{}' already taken by '{}'",
                        self.metric, existing
                    )))
                }
                _ => {
                    self.raw = Some((subscriber_id, observer));
                    Ok(())
                }
            },
        }
    }

    fn detach(&mut self, subscriber_id: &str, tenant: &str) {
        for ((bucket_tenant, _), subscribers) in self.aggregated.iter_mut() {
            if bucket_tenant == tenant {
                subscribers.remove(subscriber_id);
            }
        }
        self.aggregated.retain(|_, subscribers| !subscribers.is_empty());

        if let Some((raw_id, _)) = &self.raw {
            if raw_id == subscriber_id {
                self.raw = None;
            }
        }
    }

    fn ingest(&mut self, body: &str) {
        match MetricPayload::decode(body) {
            Ok(payload) => self.window.absorb(payload),
            Err(err) => warn!(metric = %self.metric, %err, "dropping malformed payload"),
        }
    }

    /// One aggregation tick: swap the window out, push the batch to the raw
    /// observer and tenant sums to every aggregated subscriber present in
    /// the batch. Subscribers absent from the batch receive no call.
    async fn tick(&mut self) {
        if self.window.is_empty() {
            return;
        }
        let window = std::mem::take(&mut self.window);

        if !window.batch.is_empty() {
            if let Some((observer_id, observer)) = &self.raw {
                if let Err(err) = observer
                    .on_raw_batch(&self.metric, window.batch.clone())
                    .await
                {
                    warn!(metric = %self.metric, observer = %observer_id, %err, "raw delivery failed");
                }
            }
        }

        let sums = window.batch.tenant_policy_sums();
        for ((tenant, policy), subscribers) in &self.aggregated {
            let value = sums
                .get(&(tenant.clone(), policy.clone()))
                .copied()
                .or_else(|| window.tenant_totals.get(tenant).copied());
            let Some(value) = value else {
                continue;
            };
            for (subscriber_id, subscriber) in subscribers {
                if let Err(err) = subscriber.update(&self.metric, tenant, value).await {
                    warn!(
                        metric = %self.metric,
                        subscriber = %subscriber_id,
                        %err,
                        "aggregated delivery failed, skipping subscriber"
                    );
                }
            }
        }
    }

    fn info(&self) -> HubInfo {
        HubInfo {
            metric: self.metric.clone(),
            aggregated_subscribers: self.aggregated.values().map(HashMap::len).sum(),
            has_raw_observer: self.raw.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn config() -> HubConfig {
        HubConfig {
            metric: "get_bw".into(),
            // Long enough that only explicit flushes tick during a test.
            period: Duration::from_secs(3600),
            binding: Binding::new("metrics", "hub-get_bw", "metrics.get_bw"),
        }
    }

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<(String, String, f64)>>,
        fail: bool,
    }

    #[async_trait]
    impl MetricSubscriber for Recorder {
        async fn update(
            &self,
            metric: &str,
            tenant: &str,
            value: f64,
        ) -> Result<(), DeliveryError> {
            if self.fail {
                return Err(DeliveryError::new("recorder", "subscriber terminated"));
            }
            self.updates
                .lock()
                .push((metric.to_string(), tenant.to_string(), value));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RawRecorder {
        batches: Mutex<Vec<RawBatch>>,
    }

    #[async_trait]
    impl RawBatchObserver for RawRecorder {
        async fn on_raw_batch(&self, _metric: &str, batch: RawBatch) -> Result<(), DeliveryError> {
            self.batches.lock().push(batch);
            Ok(())
        }
    }

    #[tokio::test]
    async fn aggregates_window_and_delivers_both_channels() {
        let bus = MessageBus::new();
        let hub = MetricHub::spawn(config(), &bus).await;

        let subscriber = Arc::new(Recorder::default());
        let observer = Arc::new(RawRecorder::default());
        hub.attach(
            "rule-1",
            "tenantA",
            "polX",
            SubscriberChannel::Aggregated(subscriber.clone()),
        )
        .await
        .expect("attach");
        hub.attach(
            "enforcer-1",
            "",
            "",
            SubscriberChannel::Raw(observer.clone()),
        )
        .await
        .expect("attach raw");

        hub.notify(r#"{"loc1": {"tenantA": {"polX": {"dev1": 10.0}}}}"#);
        hub.notify(r#"{"loc1": {"tenantA": {"polX": {"dev2": 5.0}}}}"#);
        hub.flush().await.expect("flush");

        let updates = subscriber.updates.lock().clone();
        assert_eq!(updates, vec![("get_bw".to_string(), "tenantA".to_string(), 15.0)]);
        assert_eq!(observer.batches.lock().len(), 1);

        // An empty window delivers nothing.
        hub.flush().await.expect("flush");
        assert_eq!(subscriber.updates.lock().len(), 1);
        assert_eq!(observer.batches.lock().len(), 1);
    }

    #[tokio::test]
    async fn second_raw_observer_is_rejected() {
        let bus = MessageBus::new();
        let hub = MetricHub::spawn(config(), &bus).await;

        let first = Arc::new(RawRecorder::default());
        let second = Arc::new(RawRecorder::default());
        hub.attach("enf-1", "", "", SubscriberChannel::Raw(first))
            .await
            .expect("first raw attach");
        let err = hub
            .attach("enf-2", "", "", SubscriberChannel::Raw(second))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Subscription(_)));

        let info = hub.info().await.expect("info");
        assert!(info.has_raw_observer);
    }

    #[tokio::test]
    async fn attach_is_idempotent_and_detach_is_a_noop_when_absent() {
        let bus = MessageBus::new();
        let hub = MetricHub::spawn(config(), &bus).await;

        let subscriber = Arc::new(Recorder::default());
        for _ in 0..2 {
            hub.attach(
                "rule-1",
                "tenantA",
                "polX",
                SubscriberChannel::Aggregated(subscriber.clone()),
            )
            .await
            .expect("attach");
        }
        let info = hub.info().await.expect("info");
        assert_eq!(info.aggregated_subscribers, 1);

        hub.detach("never-attached", "tenantA");
        hub.notify(r#"{"loc1": {"tenantA": {"polX": {"dev1": 4.0}}}}"#);
        hub.flush().await.expect("flush");
        assert_eq!(subscriber.updates.lock().len(), 1);

        hub.detach("rule-1", "tenantA");
        hub.notify(r#"{"loc1": {"tenantA": {"polX": {"dev1": 4.0}}}}"#);
        hub.flush().await.expect("flush");
        assert_eq!(subscriber.updates.lock().len(), 1);
    }

    #[tokio::test]
    async fn reattaching_under_another_policy_moves_the_slot() {
        let bus = MessageBus::new();
        let hub = MetricHub::spawn(config(), &bus).await;

        let subscriber = Arc::new(Recorder::default());
        hub.attach(
            "rule-1",
            "tenantA",
            "polX",
            SubscriberChannel::Aggregated(subscriber.clone()),
        )
        .await
        .expect("attach");
        hub.attach(
            "rule-1",
            "tenantA",
            "polY",
            SubscriberChannel::Aggregated(subscriber.clone()),
        )
        .await
        .expect("re-attach");

        let info = hub.info().await.expect("info");
        assert_eq!(info.aggregated_subscribers, 1);

        // One tick delivers once, keyed by the new policy.
        hub.notify(r#"{"loc1": {"tenantA": {"polY": {"dev1": 8.0}}}}"#);
        hub.flush().await.expect("flush");
        let updates = subscriber.updates.lock().clone();
        assert_eq!(updates, vec![("get_bw".to_string(), "tenantA".to_string(), 8.0)]);
    }

    #[tokio::test]
    async fn failed_delivery_does_not_starve_other_subscribers() {
        let bus = MessageBus::new();
        let hub = MetricHub::spawn(config(), &bus).await;

        let broken = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let healthy = Arc::new(Recorder::default());
        hub.attach("broken", "tenantA", "polX", SubscriberChannel::Aggregated(broken))
            .await
            .expect("attach");
        hub.attach(
            "healthy",
            "tenantA",
            "polX",
            SubscriberChannel::Aggregated(healthy.clone()),
        )
        .await
        .expect("attach");

        hub.notify(r#"{"loc1": {"tenantA": {"polX": {"dev1": 7.0}}}}"#);
        hub.flush().await.expect("flush");
        assert_eq!(healthy.updates.lock().len(), 1);
    }

    #[tokio::test]
    async fn malformed_payloads_are_dropped() {
        let bus = MessageBus::new();
        let hub = MetricHub::spawn(config(), &bus).await;

        let subscriber = Arc::new(Recorder::default());
        hub.attach(
            "rule-1",
            "tenantA",
            "polX",
            SubscriberChannel::Aggregated(subscriber.clone()),
        )
        .await
        .expect("attach");

        hub.notify("not json at all");
        hub.flush().await.expect("flush");
        assert!(subscriber.updates.lock().is_empty());
    }

    #[tokio::test]
    async fn consumes_payloads_from_the_bus_binding() {
        let bus = MessageBus::new();
        let hub = MetricHub::spawn(config(), &bus).await;

        let subscriber = Arc::new(Recorder::default());
        hub.attach(
            "rule-1",
            "tenantA",
            "polX",
            SubscriberChannel::Aggregated(subscriber.clone()),
        )
        .await
        .expect("attach");

        bus.publish(
            "metrics",
            "metrics.get_bw",
            r#"{"loc1": {"tenantA": {"polX": {"dev1": 3.0}}}}"#,
        )
        .await
        .expect("publish");

        // The delivery and the flush arrive on different channels of the
        // same loop; flush until the consumer arm has run.
        for _ in 0..50 {
            hub.flush().await.expect("flush");
            if !subscriber.updates.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(subscriber.updates.lock().clone().pop().map(|u| u.2), Some(3.0));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let bus = MessageBus::new();
        let hub = MetricHub::spawn(config(), &bus).await;
        hub.stop().await;
        hub.stop().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(hub.flush().await.is_err());
    }
}
