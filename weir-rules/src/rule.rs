use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{info, warn};

use weir_core::catalog::Catalog;
use weir_core::runtime::{Mailbox, Stoppable};
use weir_dsl::{ActionKind, ActionSpec, ConditionNode, Target};
use weir_metrics::{DeliveryError, HubHandle, MetricSubscriber, SubscriberChannel};

use crate::dispatch::ActionDispatcher;
use crate::error::RuleError;
use crate::state::{Edge, RuleState};

/// Point-in-time view of one rule actor.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RuleStatus {
    pub id: String,
    pub tenant: String,
    pub transient: bool,
    /// True while some referenced metric has not reported yet.
    pub awaiting_data: bool,
    /// Last confirmed truth value of the condition.
    pub active: bool,
}

enum RuleMsg {
    Update {
        metric: String,
        value: f64,
    },
    Status {
        reply: oneshot::Sender<RuleStatus>,
    },
    Stop,
}

/// Handle to a running rule actor. Implements [`MetricSubscriber`] so the
/// hubs deliver straight into the rule's mailbox.
#[derive(Clone)]
pub struct RuleHandle {
    id: String,
    tenant: String,
    mailbox: Mailbox<RuleMsg>,
}

impl RuleHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn is_stopped(&self) -> bool {
        self.mailbox.is_closed()
    }

    pub async fn status(&self) -> Result<RuleStatus, RuleError> {
        self.mailbox
            .ask(|reply| RuleMsg::Status { reply })
            .await
            .map_err(|_| RuleError::Stopped)
    }
}

#[async_trait]
impl MetricSubscriber for RuleHandle {
    async fn update(&self, metric: &str, _tenant: &str, value: f64) -> Result<(), DeliveryError> {
        self.mailbox
            .send(RuleMsg::Update {
                metric: metric.to_string(),
                value,
            })
            .map_err(|_| DeliveryError::new(self.id.clone(), "rule has stopped"))
    }
}

#[async_trait]
impl Stoppable for RuleHandle {
    async fn stop(&self) {
        let _ = self.mailbox.send(RuleMsg::Stop);
    }
}

struct ActiveRule {
    id: String,
    target: Target,
    actions: Vec<ActionSpec>,
    transient: bool,
    state: RuleState,
    /// Policy-instance ids returned by SET dispatches, consumed by the
    /// matching DELETE. Falls back to the filter name when a DELETE runs
    /// without a preceding SET.
    instance_ids: HashMap<usize, String>,
    dispatcher: Arc<dyn ActionDispatcher>,
}

impl ActiveRule {
    /// Dispatches every action for the edge. Transient rules reverse the
    /// configured kind on a falling edge. Returns whether all dispatches
    /// succeeded; on failure the edge stays unconfirmed and is retried.
    async fn apply_edge(&mut self, rising: bool) -> bool {
        for (idx, action) in self.actions.iter().enumerate() {
            let kind = if rising { action.kind } else { action.kind.inverse() };
            let result = match kind {
                ActionKind::Set => match self.dispatcher.set(&self.target, action).await {
                    Ok(instance) => {
                        self.instance_ids.insert(idx, instance);
                        Ok(())
                    }
                    Err(err) => Err(err),
                },
                ActionKind::Delete => {
                    let instance = self
                        .instance_ids
                        .remove(&idx)
                        .unwrap_or_else(|| action.filter.clone());
                    self.dispatcher.delete(&self.target, &instance).await
                }
            };

            if let Err(err) = result {
                warn!(
                    rule = %self.id,
                    filter = %action.filter,
                    %err,
                    "action dispatch failed; retrying on the next qualifying edge"
                );
                return false;
            }
        }
        true
    }
}

/// One actor per activated conditional policy.
pub struct RuleActor;

impl RuleActor {
    /// Spawns the rule, subscribes it to every metric its condition
    /// references and persists the policy liveness flag. An attach failure
    /// is logged and the rule proceeds without that subscription.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        id: impl Into<String>,
        target: Target,
        condition: ConditionNode,
        actions: Vec<ActionSpec>,
        transient: bool,
        hubs: Vec<HubHandle>,
        dispatcher: Arc<dyn ActionDispatcher>,
        catalog: Catalog,
    ) -> RuleHandle {
        let id = id.into();
        let tenant = target.tenant_id().to_string();
        let (mailbox, mut messages) = Mailbox::channel();
        let handle = RuleHandle {
            id: id.clone(),
            tenant: tenant.clone(),
            mailbox,
        };
        let subscriber: Arc<dyn MetricSubscriber> = Arc::new(handle.clone());

        let actor_handle = handle.clone();
        tokio::spawn(async move {
            let mut rule = ActiveRule {
                id: id.clone(),
                target,
                actions,
                transient,
                state: RuleState::new(condition),
                instance_ids: HashMap::new(),
                dispatcher,
            };

            catalog.set_policy_alive(&id, true);
            for hub in &hubs {
                if let Err(err) = hub
                    .attach(
                        &id,
                        &tenant,
                        &id,
                        SubscriberChannel::Aggregated(subscriber.clone()),
                    )
                    .await
                {
                    warn!(rule = %id, metric = %hub.metric(), %err, "subscription failed; rule proceeds without it");
                }
            }
            info!(rule = %id, tenant = %tenant, transient, "rule activated");

            while let Some(msg) = messages.recv().await {
                match msg {
                    RuleMsg::Update { metric, value } => match rule.state.update(&metric, value) {
                        Some(Edge::Rising) => {
                            if rule.apply_edge(true).await {
                                rule.state.confirm(true);
                                if !rule.transient {
                                    info!(rule = %rule.id, "one-shot rule fired, stopping");
                                    break;
                                }
                            }
                        }
                        Some(Edge::Falling) => {
                            // One-shot rules fire on true only.
                            if rule.transient && rule.apply_edge(false).await {
                                rule.state.confirm(false);
                            }
                        }
                        None => {}
                    },
                    RuleMsg::Status { reply } => {
                        let _ = reply.send(RuleStatus {
                            id: rule.id.clone(),
                            tenant: tenant.clone(),
                            transient: rule.transient,
                            awaiting_data: !rule.state.has_all_metrics(),
                            active: rule.state.last_fired(),
                        });
                    }
                    RuleMsg::Stop => break,
                }
            }

            for hub in &hubs {
                hub.detach(&rule.id, &tenant);
            }
            catalog.set_policy_alive(&rule.id, false);
            info!(rule = %rule.id, "rule stopped");
        });

        actor_handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use parking_lot::Mutex;
    use std::time::Duration;
    use weir_dsl::{BoolOp, CompareOp};

    #[derive(Default)]
    struct FakeDispatcher {
        calls: Mutex<Vec<(ActionKind, String)>>,
        fail_next: Mutex<usize>,
    }

    #[async_trait]
    impl ActionDispatcher for FakeDispatcher {
        async fn set(&self, _target: &Target, action: &ActionSpec) -> Result<String, DispatchError> {
            let mut fail = self.fail_next.lock();
            if *fail > 0 {
                *fail -= 1;
                return Err(DispatchError::Http("connection refused".into()));
            }
            self.calls.lock().push((ActionKind::Set, action.filter.clone()));
            Ok(format!("instance-{}", self.calls.lock().len()))
        }

        async fn delete(&self, _target: &Target, instance_id: &str) -> Result<(), DispatchError> {
            self.calls
                .lock()
                .push((ActionKind::Delete, instance_id.to_string()));
            Ok(())
        }
    }

    fn condition() -> ConditionNode {
        ConditionNode::binary(
            BoolOp::And,
            ConditionNode::leaf("get_ops", CompareOp::Gt, 10.0),
            ConditionNode::leaf("put_ops", CompareOp::Lt, 5.0),
        )
    }

    fn spawn_rule(transient: bool, dispatcher: Arc<FakeDispatcher>) -> RuleHandle {
        RuleActor::spawn(
            "rule-1",
            Target::tenant("T1"),
            condition(),
            vec![ActionSpec::new(ActionKind::Set, "compression")],
            transient,
            Vec::new(),
            dispatcher,
            Catalog::new(),
        )
    }

    async fn wait_for_calls(dispatcher: &FakeDispatcher, count: usize) {
        for _ in 0..100 {
            if dispatcher.calls.lock().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "expected {count} dispatch calls, saw {:?}",
            dispatcher.calls.lock()
        );
    }

    #[tokio::test]
    async fn never_dispatches_before_all_metrics_report() {
        let dispatcher = Arc::new(FakeDispatcher::default());
        let rule = spawn_rule(false, dispatcher.clone());

        rule.update("get_ops", "T1", 100.0).await.expect("update");
        let status = rule.status().await.expect("status");
        assert!(status.awaiting_data);
        assert!(dispatcher.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn one_shot_rule_fires_once_and_stops() {
        let dispatcher = Arc::new(FakeDispatcher::default());
        let rule = spawn_rule(false, dispatcher.clone());

        rule.update("put_ops", "T1", 0.0).await.expect("update");
        rule.update("get_ops", "T1", 100.0).await.expect("update");
        wait_for_calls(&dispatcher, 1).await;

        // The actor exits after the confirmed fire; further updates fail
        // against the closed mailbox and dispatch nothing.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rule.is_stopped());
        assert!(rule.update("get_ops", "T1", 200.0).await.is_err());
        assert_eq!(dispatcher.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn transient_rule_toggles_set_delete_set() {
        let dispatcher = Arc::new(FakeDispatcher::default());
        let rule = spawn_rule(true, dispatcher.clone());

        rule.update("put_ops", "T1", 0.0).await.expect("update");
        rule.update("get_ops", "T1", 100.0).await.expect("update");
        wait_for_calls(&dispatcher, 1).await;
        rule.update("get_ops", "T1", 1.0).await.expect("update");
        wait_for_calls(&dispatcher, 2).await;
        rule.update("get_ops", "T1", 50.0).await.expect("update");
        wait_for_calls(&dispatcher, 3).await;

        let calls = dispatcher.calls.lock().clone();
        assert_eq!(
            calls,
            vec![
                (ActionKind::Set, "compression".to_string()),
                // The reversal undeploys the instance the SET returned.
                (ActionKind::Delete, "instance-1".to_string()),
                (ActionKind::Set, "compression".to_string()),
            ]
        );
        assert!(!rule.is_stopped());
    }

    #[tokio::test]
    async fn failed_dispatch_is_retried_on_the_next_qualifying_edge() {
        let dispatcher = Arc::new(FakeDispatcher::default());
        *dispatcher.fail_next.lock() = 1;
        let rule = spawn_rule(false, dispatcher.clone());

        rule.update("put_ops", "T1", 0.0).await.expect("update");
        rule.update("get_ops", "T1", 100.0).await.expect("update");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(dispatcher.calls.lock().is_empty());
        assert!(!rule.is_stopped());

        // Same truth value again: the unconfirmed edge re-fires.
        rule.update("get_ops", "T1", 120.0).await.expect("update");
        wait_for_calls(&dispatcher, 1).await;
    }

    #[tokio::test]
    async fn stop_detaches_and_clears_the_liveness_flag() {
        let dispatcher = Arc::new(FakeDispatcher::default());
        let catalog = Catalog::new();
        let rule = RuleActor::spawn(
            "rule-9",
            Target::tenant("T1"),
            condition(),
            vec![ActionSpec::new(ActionKind::Set, "compression")],
            true,
            Vec::new(),
            dispatcher,
            catalog.clone(),
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(catalog.policy_alive("rule-9"), Some(true));

        rule.stop().await;
        rule.stop().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(catalog.policy_alive("rule-9"), Some(false));
        assert!(rule.is_stopped());
    }
}
