use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::bus::Binding;
use crate::errors::{CoreError, Result};

/// Network location a metric hub consumes its raw payloads from:
/// the `metric:<name>` catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricSource {
    pub name: String,
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl MetricSource {
    pub fn binding(&self) -> Binding {
        Binding::new(&self.exchange, &self.queue, &self.routing_key)
    }
}

/// Catalog entry describing a deployable processing filter:
/// the `filter:<name>` catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterSpec {
    pub name: String,
    /// Identifier the control API knows the filter binary by; deploy
    /// requests name the filter by this, not by its rule-text name.
    pub identifier: String,
    /// Controller-relative route deploy requests for this filter go
    /// through, e.g. `filters`.
    pub activation_url: String,
    /// Accepted `WITH` parameters and their value types, used to validate
    /// rule text at parse time.
    #[serde(default)]
    pub valid_parameters: BTreeMap<String, String>,
}

#[derive(Default)]
struct Inner {
    metrics: HashMap<String, MetricSource>,
    filters: HashMap<String, FilterSpec>,
    groups: HashMap<String, Vec<String>>,
    /// Keyed by the canonical `SLO:bandwidth:<slo>:<account>#<policy>` form.
    slos: HashMap<String, f64>,
    /// Keyed by `policy:<id>`; holds the persisted liveness flag for
    /// transient rules.
    policies: HashMap<String, bool>,
}

/// Read-mostly client for the external configuration store, scoped to the
/// keys the control plane uses: metric catalog, filter catalog, tenant
/// groups, SLO objectives and transient-rule liveness.
#[derive(Default, Clone)]
pub struct Catalog {
    inner: Arc<RwLock<Inner>>,
}

/// Canonical key for a bandwidth SLO entry.
pub fn slo_key(slo: &str, account: &str, policy: &str) -> String {
    format!("SLO:bandwidth:{}:{}#{}", slo, account, policy)
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_metric(&self, source: MetricSource) {
        let mut inner = self.inner.write();
        inner.metrics.insert(source.name.clone(), source);
    }

    pub fn metric(&self, name: &str) -> Option<MetricSource> {
        self.inner.read().metrics.get(name).cloned()
    }

    pub fn has_metric(&self, name: &str) -> bool {
        self.inner.read().metrics.contains_key(name)
    }

    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().metrics.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn register_filter(&self, spec: FilterSpec) {
        let mut inner = self.inner.write();
        inner.filters.insert(spec.name.clone(), spec);
    }

    pub fn filter(&self, name: &str) -> Option<FilterSpec> {
        self.inner.read().filters.get(name).cloned()
    }

    pub fn register_group(&self, name: impl Into<String>, tenants: Vec<String>) {
        let mut inner = self.inner.write();
        inner.groups.insert(name.into(), tenants);
    }

    pub fn group(&self, name: &str) -> Option<Vec<String>> {
        self.inner.read().groups.get(name).cloned()
    }

    pub fn set_slo(&self, slo: &str, account: &str, policy: &str, value: f64) {
        let mut inner = self.inner.write();
        inner.slos.insert(slo_key(slo, account, policy), value);
    }

    /// All accounts holding an objective under the given SLO name, with
    /// their per-policy budgets. Accounts absent here are excluded from
    /// SLO enforcement.
    pub fn slo_budgets(&self, slo: &str) -> HashMap<String, HashMap<String, f64>> {
        let prefix = format!("SLO:bandwidth:{}:", slo);
        let inner = self.inner.read();
        let mut budgets: HashMap<String, HashMap<String, f64>> = HashMap::new();
        for (key, value) in &inner.slos {
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            let Some((account, policy)) = rest.split_once('#') else {
                continue;
            };
            budgets
                .entry(account.to_string())
                .or_default()
                .insert(policy.to_string(), *value);
        }
        budgets
    }

    pub fn set_policy_alive(&self, policy_id: &str, alive: bool) {
        let mut inner = self.inner.write();
        inner.policies.insert(format!("policy:{}", policy_id), alive);
    }

    pub fn policy_alive(&self, policy_id: &str) -> Option<bool> {
        self.inner
            .read()
            .policies
            .get(&format!("policy:{}", policy_id))
            .copied()
    }

    /// Fails when the catalog has no metric entries at all, which a newly
    /// spawned hub treats as a fatal initialization error.
    pub fn require_metrics(&self) -> Result<()> {
        if self.inner.read().metrics.is_empty() {
            return Err(CoreError::Catalog(
                "metric catalog is empty or unreachable".into(),
            ));
        }
        Ok(())
    }

    /// Loads a bootstrap snapshot of the configuration store.
    pub fn load_document(&self, document: CatalogDocument) {
        for metric in document.metrics {
            self.register_metric(metric);
        }
        for filter in document.filters {
            self.register_filter(filter);
        }
        for (name, tenants) in document.groups {
            self.register_group(name, tenants);
        }
        for entry in document.slos {
            self.set_slo(&entry.slo, &entry.account, &entry.policy, entry.value);
        }
    }
}

/// Serialized snapshot of the configuration-store keys the control plane
/// reads at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogDocument {
    #[serde(default)]
    pub metrics: Vec<MetricSource>,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub slos: Vec<SloEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloEntry {
    pub slo: String,
    pub account: String,
    pub policy: String,
    pub value: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slo_keys_use_canonical_form() {
        assert_eq!(
            slo_key("get_bw", "AUTH_a1", "0"),
            "SLO:bandwidth:get_bw:AUTH_a1#0"
        );
    }

    #[test]
    fn slo_budgets_group_by_account_and_policy() {
        let catalog = Catalog::new();
        catalog.set_slo("get_bw", "AUTH_a1", "0", 20.0);
        catalog.set_slo("get_bw", "AUTH_a1", "1", 30.0);
        catalog.set_slo("get_bw", "AUTH_b2", "0", 80.0);
        catalog.set_slo("put_bw", "AUTH_b2", "0", 10.0);

        let budgets = catalog.slo_budgets("get_bw");
        assert_eq!(budgets.len(), 2);
        assert_eq!(budgets["AUTH_a1"]["1"], 30.0);
        assert_eq!(budgets["AUTH_b2"]["0"], 80.0);
        assert!(!budgets["AUTH_b2"].contains_key("1"));
    }

    #[test]
    fn policy_liveness_round_trips() {
        let catalog = Catalog::new();
        assert_eq!(catalog.policy_alive("42"), None);
        catalog.set_policy_alive("42", true);
        assert_eq!(catalog.policy_alive("42"), Some(true));
        catalog.set_policy_alive("42", false);
        assert_eq!(catalog.policy_alive("42"), Some(false));
    }
}
