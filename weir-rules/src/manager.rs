use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use weir_core::catalog::Catalog;
use weir_core::runtime::{Registry, Stoppable};
use weir_dsl::{ActionKind, RuleParser, Target};
use weir_metrics::HubHandle;

use crate::dispatch::ActionDispatcher;
use crate::error::RuleError;
use crate::rule::{RuleActor, RuleHandle};

/// Registry name a hub is looked up under when a rule subscribes to its
/// metric.
pub fn hub_registry_name(metric: &str) -> String {
    format!("hub:{}", metric)
}

/// Outcome of activating one rule text against one concrete target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivatedPolicy {
    pub id: String,
    pub target: String,
    pub transient: bool,
    /// False for unconditioned rules, whose actions ran immediately.
    pub conditional: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RuleSummary {
    pub id: String,
    pub tenant: String,
    pub text: String,
}

struct ManagedRule {
    handle: RuleHandle,
    text: String,
}

/// Owns the live rule actors: parses submitted rule text, spawns one actor
/// per conditional (target, policy) pair and dispatches unconditioned
/// actions immediately.
#[derive(Clone)]
pub struct RuleManager {
    parser: Arc<RuleParser>,
    catalog: Catalog,
    registry: Registry,
    dispatcher: Arc<dyn ActionDispatcher>,
    rules: Arc<RwLock<HashMap<String, ManagedRule>>>,
}

impl RuleManager {
    pub fn new(
        catalog: Catalog,
        registry: Registry,
        dispatcher: Arc<dyn ActionDispatcher>,
    ) -> Self {
        Self {
            parser: Arc::new(RuleParser::new(catalog.clone())),
            catalog,
            registry,
            dispatcher,
            rules: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Parses and activates a rule text. Conditional rules spawn one actor
    /// per target; unconditioned rules run their actions right away.
    pub async fn activate(&self, text: &str) -> Result<Vec<ActivatedPolicy>, RuleError> {
        let template = self.parser.parse(text)?;
        let mut activated = Vec::with_capacity(template.targets.len());

        match &template.condition {
            Some(condition) => {
                for target in &template.targets {
                    let id = format!("rule-{}", Uuid::new_v4());
                    let hubs = self.hubs_for(&template.referenced_metrics());
                    let handle = RuleActor::spawn(
                        id.clone(),
                        target.clone(),
                        condition.clone(),
                        template.actions.clone(),
                        template.transient,
                        hubs,
                        self.dispatcher.clone(),
                        self.catalog.clone(),
                    );
                    self.rules.write().insert(
                        id.clone(),
                        ManagedRule {
                            handle,
                            text: text.to_string(),
                        },
                    );
                    activated.push(ActivatedPolicy {
                        id,
                        target: target.path(),
                        transient: template.transient,
                        conditional: true,
                    });
                }
            }
            None => {
                for target in &template.targets {
                    self.apply_static(target, &template.actions).await?;
                    activated.push(ActivatedPolicy {
                        id: format!("static-{}", Uuid::new_v4()),
                        target: target.path(),
                        transient: false,
                        conditional: false,
                    });
                }
            }
        }

        info!(rule_text = %text, count = activated.len(), "rule activated");
        Ok(activated)
    }

    /// Actions of an unconditioned rule are applied once at activation.
    async fn apply_static(
        &self,
        target: &Target,
        actions: &[weir_dsl::ActionSpec],
    ) -> Result<(), RuleError> {
        for action in actions {
            match action.kind {
                ActionKind::Set => {
                    let instance = self.dispatcher.set(target, action).await?;
                    info!(target = %target, filter = %action.filter, %instance, "static filter deployed");
                }
                ActionKind::Delete => {
                    self.dispatcher.delete(target, &action.filter).await?;
                    info!(target = %target, filter = %action.filter, "static filter undeployed");
                }
            }
        }
        Ok(())
    }

    fn hubs_for(&self, metrics: &std::collections::BTreeSet<String>) -> Vec<HubHandle> {
        let mut hubs = Vec::with_capacity(metrics.len());
        for metric in metrics {
            match self.registry.lookup::<HubHandle>(&hub_registry_name(metric)) {
                Some(hub) => hubs.push(hub),
                None => warn!(%metric, "no hub running for metric; rule proceeds without it"),
            }
        }
        hubs
    }

    /// Live rules, with entries for actors that already stopped on their
    /// own (one-shot fires) pruned out.
    pub fn list(&self) -> Vec<RuleSummary> {
        let mut rules = self.rules.write();
        rules.retain(|_, managed| !managed.handle.is_stopped());
        let mut summaries: Vec<RuleSummary> = rules
            .iter()
            .map(|(id, managed)| RuleSummary {
                id: id.clone(),
                tenant: managed.handle.tenant().to_string(),
                text: managed.text.clone(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub fn get(&self, id: &str) -> Option<RuleHandle> {
        self.rules.read().get(id).map(|managed| managed.handle.clone())
    }

    /// Stops one rule and forgets it.
    pub async fn stop(&self, id: &str) -> Result<(), RuleError> {
        let managed = self
            .rules
            .write()
            .remove(id)
            .ok_or_else(|| RuleError::NotFound(id.to_string()))?;
        managed.handle.stop().await;
        Ok(())
    }

    pub async fn stop_all(&self) {
        let drained: Vec<ManagedRule> = {
            let mut rules = self.rules.write();
            rules.drain().map(|(_, managed)| managed).collect()
        };
        for managed in drained {
            managed.handle.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use weir_core::bus::MessageBus;
    use weir_core::catalog::{FilterSpec, MetricSource};
    use weir_dsl::ActionSpec;
    use weir_metrics::{HubConfig, MetricHub};

    #[derive(Default)]
    struct FakeDispatcher {
        calls: Mutex<Vec<(ActionKind, String)>>,
    }

    #[async_trait]
    impl ActionDispatcher for FakeDispatcher {
        async fn set(&self, _target: &Target, action: &ActionSpec) -> Result<String, DispatchError> {
            self.calls.lock().push((ActionKind::Set, action.filter.clone()));
            Ok("instance-1".into())
        }

        async fn delete(&self, _target: &Target, instance_id: &str) -> Result<(), DispatchError> {
            self.calls
                .lock()
                .push((ActionKind::Delete, instance_id.to_string()));
            Ok(())
        }
    }

    fn catalog() -> Catalog {
        let catalog = Catalog::new();
        catalog.register_metric(MetricSource {
            name: "get_ops".into(),
            exchange: "metrics".into(),
            queue: "hub-get_ops".into(),
            routing_key: "metrics.get_ops".into(),
        });
        catalog.register_filter(FilterSpec {
            name: "compression".into(),
            identifier: "compression-1.0.jar".into(),
            activation_url: "filters".into(),
            valid_parameters: BTreeMap::new(),
        });
        catalog
    }

    async fn manager_with_hub() -> (RuleManager, Arc<FakeDispatcher>, weir_metrics::HubHandle) {
        let catalog = catalog();
        let registry = Registry::new();
        let bus = MessageBus::new();
        let hub = MetricHub::spawn(
            HubConfig {
                metric: "get_ops".into(),
                period: Duration::from_secs(3600),
                binding: catalog.metric("get_ops").unwrap().binding(),
            },
            &bus,
        )
        .await;
        registry.register(hub_registry_name("get_ops"), hub.clone());

        let dispatcher = Arc::new(FakeDispatcher::default());
        let manager = RuleManager::new(catalog, registry, dispatcher.clone());
        (manager, dispatcher, hub)
    }

    #[tokio::test]
    async fn conditional_rules_subscribe_to_their_hubs() {
        let (manager, dispatcher, hub) = manager_with_hub().await;
        let activated = manager
            .activate("FOR TENANT:T1 WHEN get_ops > 5 DO SET compression")
            .await
            .expect("activate");
        assert_eq!(activated.len(), 1);
        assert!(activated[0].conditional);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let info = hub.info().await.expect("hub info");
        assert_eq!(info.aggregated_subscribers, 1);
        assert!(dispatcher.calls.lock().is_empty());
        assert_eq!(manager.list().len(), 1);
    }

    #[tokio::test]
    async fn unconditioned_rules_dispatch_immediately() {
        let (manager, dispatcher, _hub) = manager_with_hub().await;
        let activated = manager
            .activate("FOR TENANT:T1 DO SET compression")
            .await
            .expect("activate");
        assert!(!activated[0].conditional);
        assert_eq!(
            dispatcher.calls.lock().clone(),
            vec![(ActionKind::Set, "compression".to_string())]
        );
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn parse_failures_activate_nothing() {
        let (manager, dispatcher, _hub) = manager_with_hub().await;
        let err = manager
            .activate("FOR TENANT:T1 WHEN nope > 5 DO SET compression")
            .await
            .unwrap_err();
        assert!(matches!(err, RuleError::Parse(_)));
        assert!(dispatcher.calls.lock().is_empty());
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn stop_removes_the_rule() {
        let (manager, _dispatcher, hub) = manager_with_hub().await;
        let activated = manager
            .activate("FOR TENANT:T1 WHEN get_ops > 5 DO SET compression TRANSIENT")
            .await
            .expect("activate");
        let id = activated[0].id.clone();

        manager.stop(&id).await.expect("stop");
        assert!(matches!(
            manager.stop(&id).await,
            Err(RuleError::NotFound(_))
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let info = hub.info().await.expect("hub info");
        assert_eq!(info.aggregated_subscribers, 0);
    }
}
