use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tracing::debug;

use weir_metrics::{Flow, RawBatch};

use crate::error::AllocationError;

/// SLO budgets as read from the catalog each tick: account → policy → value.
pub type SloSnapshot = HashMap<String, HashMap<String, f64>>;

/// Bandwidth granted to one `(account, location)` pair. Device and policy
/// labels come from the first flow that contributed to the share.
#[derive(Debug, Clone, PartialEq)]
pub struct Share {
    pub policy: String,
    pub device: String,
    pub value: f64,
}

/// Assignment computed by a strategy for one tick, keyed on
/// `(account, location)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assignment {
    shares: BTreeMap<(String, String), Share>,
}

impl Assignment {
    pub fn add(&mut self, account: &str, location: &str, policy: &str, device: &str, amount: f64) {
        let entry = self
            .shares
            .entry((account.to_string(), location.to_string()))
            .or_insert_with(|| Share {
                policy: policy.to_string(),
                device: device.to_string(),
                value: 0.0,
            });
        entry.value += amount;
    }

    pub fn value(&self, account: &str, location: &str) -> f64 {
        self.shares
            .get(&(account.to_string(), location.to_string()))
            .map(|share| share.value)
            .unwrap_or(0.0)
    }

    pub fn total(&self) -> f64 {
        self.shares.values().map(|share| share.value).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(String, String), &Share)> {
        self.shares.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.shares.is_empty()
    }

    pub fn len(&self) -> usize {
        self.shares.len()
    }
}

/// A pure allocation function over the tick's raw batch plus the SLO
/// snapshot. Per-account problems (zero flows, missing SLO) are skipped,
/// never raised.
pub trait AllocationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// How long an assignment survives without updates before the loop
    /// forgets it and re-publishes every flow.
    fn reset_window(&self) -> Duration;

    fn compute(&self, batch: &RawBatch, slos: &SloSnapshot) -> Assignment;
}

/// Splits each account's per-policy budget over its observed concurrent
/// request count, so every request gets an equal slice.
pub struct ProportionalPerTenant {
    pub reset_window: Duration,
}

impl Default for ProportionalPerTenant {
    fn default() -> Self {
        Self {
            reset_window: Duration::from_secs(5),
        }
    }
}

impl AllocationStrategy for ProportionalPerTenant {
    fn name(&self) -> &'static str {
        "proportional_per_tenant"
    }

    fn reset_window(&self) -> Duration {
        self.reset_window
    }

    fn compute(&self, batch: &RawBatch, slos: &SloSnapshot) -> Assignment {
        let mut groups: BTreeMap<(String, String), Vec<Flow>> = BTreeMap::new();
        for flow in batch.flows() {
            groups
                .entry((flow.account.clone(), flow.policy.clone()))
                .or_default()
                .push(flow);
        }

        let mut assignment = Assignment::default();
        for ((account, policy), flows) in groups {
            let requests: f64 = flows.iter().map(|flow| flow.value).sum();
            if requests <= 0.0 {
                debug!(err = %AllocationError::ZeroFlows { account: account.clone() }, "skipping account");
                continue;
            }
            let budget = match slos.get(&account).and_then(|policies| policies.get(&policy)) {
                Some(budget) => *budget,
                None => {
                    debug!(err = %AllocationError::MissingSlo { account: account.clone() }, "skipping account");
                    continue;
                }
            };
            let per_request = budget / requests;
            for flow in flows {
                assignment.add(
                    &account,
                    &flow.location,
                    &flow.policy,
                    &flow.device,
                    per_request * flow.value,
                );
            }
        }
        assignment
    }
}

/// Splits one global replication budget evenly across every replication
/// flow observed in the batch. SLO entries are not consulted.
pub struct ProportionalReplication {
    pub total_budget: f64,
    pub reset_window: Duration,
}

impl ProportionalReplication {
    pub fn new(total_budget: f64) -> Self {
        Self {
            total_budget,
            reset_window: Duration::from_secs(6),
        }
    }
}

impl AllocationStrategy for ProportionalReplication {
    fn name(&self) -> &'static str {
        "proportional_replication"
    }

    fn reset_window(&self) -> Duration {
        self.reset_window
    }

    fn compute(&self, batch: &RawBatch, _slos: &SloSnapshot) -> Assignment {
        let flows = batch.flows();
        if flows.is_empty() {
            return Assignment::default();
        }
        let share = self.total_budget / flows.len() as f64;

        let mut assignment = Assignment::default();
        for flow in flows {
            assignment.add(&flow.account, &flow.location, &flow.policy, &flow.device, share);
        }
        assignment
    }
}

/// Two-stage allocation: guarantee each account its SLO budget clamped to
/// the per-disk ceiling, then split the remaining headroom evenly across
/// every active account and run it through the same clamp.
pub struct MinSloWithSpareShare {
    /// Ceiling for one account's total at one location.
    pub per_disk_capacity: f64,
    pub disk_capacity: f64,
    pub proxy_capacity: f64,
    pub reset_window: Duration,
}

impl MinSloWithSpareShare {
    pub fn new(per_disk_capacity: f64, disk_capacity: f64, proxy_capacity: f64) -> Self {
        Self {
            per_disk_capacity,
            disk_capacity,
            proxy_capacity,
            reset_window: Duration::from_secs(9),
        }
    }

    /// Hands each flow an even slice of `budget`, clamped so the account's
    /// running total at any location never exceeds the per-disk ceiling.
    /// Returns the amount the clamp withheld.
    fn allocate_clamped(
        &self,
        account: &str,
        budget: f64,
        flows: &[Flow],
        assignment: &mut Assignment,
    ) -> f64 {
        let per_flow = budget / flows.len() as f64;
        let mut surplus = 0.0;
        for flow in flows {
            let existing = assignment.value(account, &flow.location);
            let allowed = (self.per_disk_capacity - existing).max(0.0);
            let granted = per_flow.min(allowed);
            surplus += per_flow - granted;
            if granted > 0.0 {
                assignment.add(account, &flow.location, &flow.policy, &flow.device, granted);
            }
        }
        surplus
    }
}

fn account_budget(slos: &SloSnapshot, account: &str) -> Option<f64> {
    slos.get(account)
        .map(|policies| policies.values().sum::<f64>())
}

impl AllocationStrategy for MinSloWithSpareShare {
    fn name(&self) -> &'static str {
        "min_slo_with_spare_share"
    }

    fn reset_window(&self) -> Duration {
        self.reset_window
    }

    fn compute(&self, batch: &RawBatch, slos: &SloSnapshot) -> Assignment {
        let mut by_account: BTreeMap<String, Vec<Flow>> = BTreeMap::new();
        for flow in batch.flows() {
            by_account.entry(flow.account.clone()).or_default().push(flow);
        }
        // Light accounts first so they are served before capacity runs out.
        let mut order: Vec<&String> = by_account.keys().collect();
        order.sort_by_key(|account| (by_account[*account].len(), account.as_str()));

        let mut assignment = Assignment::default();
        let mut surplus = 0.0;

        for account in &order {
            let flows = &by_account[*account];
            match account_budget(slos, account) {
                Some(budget) => {
                    surplus += self.allocate_clamped(account, budget, flows, &mut assignment);
                }
                None => {
                    debug!(
                        err = %AllocationError::MissingSlo { account: (*account).clone() },
                        "account only participates in the spare stage"
                    );
                }
            }
        }

        let available =
            (self.proxy_capacity.min(self.disk_capacity) - assignment.total()).max(0.0);
        if available > 0.0 && !order.is_empty() {
            let spare = available / order.len() as f64;
            for account in &order {
                surplus += self.allocate_clamped(account, spare, &by_account[*account], &mut assignment);
            }
        }

        if surplus > 0.0 {
            debug!(strategy = self.name(), surplus, "bandwidth withheld by disk caps");
        }
        assignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(flows: &[(&str, &str, &str, &str, f64)]) -> RawBatch {
        let mut raw = RawBatch::default();
        for (location, account, policy, device, value) in flows {
            let mut inner = RawBatch::default();
            inner
                .0
                .entry(location.to_string())
                .or_default()
                .entry(account.to_string())
                .or_default()
                .entry(policy.to_string())
                .or_default()
                .insert(device.to_string(), *value);
            raw.merge(inner);
        }
        raw
    }

    fn slos(entries: &[(&str, &str, f64)]) -> SloSnapshot {
        let mut snapshot = SloSnapshot::new();
        for (account, policy, value) in entries {
            snapshot
                .entry(account.to_string())
                .or_default()
                .insert(policy.to_string(), *value);
        }
        snapshot
    }

    #[test]
    fn proportional_splits_the_budget_by_request_count() {
        let strategy = ProportionalPerTenant::default();
        let raw = batch(&[
            ("node1:6000", "AUTH_a", "0", "sdb1", 3.0),
            ("node2:6000", "AUTH_a", "0", "sdb1", 1.0),
        ]);
        let assignment = strategy.compute(&raw, &slos(&[("AUTH_a", "0", 100.0)]));

        assert_eq!(assignment.value("AUTH_a", "node1:6000"), 75.0);
        assert_eq!(assignment.value("AUTH_a", "node2:6000"), 25.0);
    }

    #[test]
    fn proportional_skips_accounts_without_a_budget() {
        let strategy = ProportionalPerTenant::default();
        let raw = batch(&[
            ("node1:6000", "AUTH_a", "0", "sdb1", 2.0),
            ("node1:6000", "AUTH_b", "0", "sdb1", 2.0),
        ]);
        let assignment = strategy.compute(&raw, &slos(&[("AUTH_a", "0", 40.0)]));

        assert_eq!(assignment.len(), 1);
        assert_eq!(assignment.value("AUTH_a", "node1:6000"), 40.0);
    }

    #[test]
    fn replication_splits_the_global_budget_evenly() {
        let strategy = ProportionalReplication::new(90.0);
        let raw = batch(&[
            ("node1:6000", "AUTH_a", "0", "sdb1", 1.0),
            ("node2:6000", "AUTH_a", "0", "sdb1", 1.0),
            ("node3:6000", "AUTH_b", "0", "sdb1", 1.0),
        ]);
        let assignment = strategy.compute(&raw, &SloSnapshot::new());

        assert_eq!(assignment.value("AUTH_a", "node1:6000"), 30.0);
        assert_eq!(assignment.value("AUTH_a", "node2:6000"), 30.0);
        assert_eq!(assignment.value("AUTH_b", "node3:6000"), 30.0);
        assert!(strategy
            .compute(&RawBatch::default(), &SloSnapshot::new())
            .is_empty());
    }

    #[test]
    fn min_slo_clamps_to_the_disk_ceiling() {
        // Both accounts saturate one flow on the same 70-capacity disk.
        // The 80-budget account loses 10 to the clamp and no headroom is
        // left for the spare stage.
        let strategy = MinSloWithSpareShare::new(70.0, 70.0, 1000.0);
        let raw = batch(&[
            ("node1:6000", "AUTH_a", "0", "sdb1", 70.0),
            ("node1:6000", "AUTH_b", "0", "sdb1", 70.0),
        ]);
        let assignment = strategy.compute(
            &raw,
            &slos(&[("AUTH_a", "0", 20.0), ("AUTH_b", "0", 80.0)]),
        );

        assert_eq!(assignment.value("AUTH_a", "node1:6000"), 20.0);
        assert_eq!(assignment.value("AUTH_b", "node1:6000"), 70.0);
    }

    #[test]
    fn min_slo_splits_spare_capacity_evenly() {
        // Same budgets but cluster headroom beyond stage 1: 200 - 90 = 110
        // spare, 55 per account, clamped by each account's remaining
        // per-disk allowance.
        let strategy = MinSloWithSpareShare::new(70.0, 200.0, 200.0);
        let raw = batch(&[
            ("node1:6000", "AUTH_a", "0", "sdb1", 70.0),
            ("node1:6000", "AUTH_b", "0", "sdb1", 70.0),
        ]);
        let assignment = strategy.compute(
            &raw,
            &slos(&[("AUTH_a", "0", 20.0), ("AUTH_b", "0", 80.0)]),
        );

        assert_eq!(assignment.value("AUTH_a", "node1:6000"), 70.0);
        assert_eq!(assignment.value("AUTH_b", "node1:6000"), 70.0);
    }

    #[test]
    fn accounts_without_slo_join_only_the_spare_stage() {
        let strategy = MinSloWithSpareShare::new(100.0, 100.0, 100.0);
        let raw = batch(&[
            ("node1:6000", "AUTH_a", "0", "sdb1", 1.0),
            ("node2:6000", "AUTH_c", "0", "sdb1", 1.0),
        ]);
        let assignment = strategy.compute(&raw, &slos(&[("AUTH_a", "0", 20.0)]));

        // Stage 1 grants AUTH_a its 20; the remaining 80 splits 40/40.
        assert_eq!(assignment.value("AUTH_a", "node1:6000"), 60.0);
        assert_eq!(assignment.value("AUTH_c", "node2:6000"), 40.0);
    }
}
