use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::HubError;

/// Unaggregated bandwidth batch as it arrives from the transport:
/// location → account → policy → device → value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawBatch(
    pub BTreeMap<String, BTreeMap<String, BTreeMap<String, BTreeMap<String, f64>>>>,
);

/// One flattened flow out of a [`RawBatch`].
#[derive(Debug, Clone, PartialEq)]
pub struct Flow {
    pub location: String,
    pub account: String,
    pub policy: String,
    pub device: String,
    pub value: f64,
}

impl RawBatch {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Adds another batch into this one, summing overlapping flows.
    pub fn merge(&mut self, other: RawBatch) {
        for (location, accounts) in other.0 {
            let loc = self.0.entry(location).or_default();
            for (account, policies) in accounts {
                let acc = loc.entry(account).or_default();
                for (policy, devices) in policies {
                    let pol = acc.entry(policy).or_default();
                    for (device, value) in devices {
                        *pol.entry(device).or_insert(0.0) += value;
                    }
                }
            }
        }
    }

    /// Every flow in the batch, flattened.
    pub fn flows(&self) -> Vec<Flow> {
        let mut flows = Vec::new();
        for (location, accounts) in &self.0 {
            for (account, policies) in accounts {
                for (policy, devices) in policies {
                    for (device, value) in devices {
                        flows.push(Flow {
                            location: location.clone(),
                            account: account.clone(),
                            policy: policy.clone(),
                            device: device.clone(),
                            value: *value,
                        });
                    }
                }
            }
        }
        flows
    }

    /// Per-(tenant, policy) sums across all locations and devices.
    pub fn tenant_policy_sums(&self) -> HashMap<(String, String), f64> {
        let mut sums: HashMap<(String, String), f64> = HashMap::new();
        for flow in self.flows() {
            *sums.entry((flow.account, flow.policy)).or_insert(0.0) += flow.value;
        }
        sums
    }
}

/// Decoded transport payload. Bandwidth metrics arrive in the nested form;
/// request-rate style metrics use the flat `{account: value}` form.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricPayload {
    Nested(RawBatch),
    Flat(BTreeMap<String, f64>),
}

impl MetricPayload {
    /// Decodes a UTF-8 JSON body. The nested shape is tried first; a flat
    /// object of numbers is accepted as the per-tenant variant.
    pub fn decode(body: &str) -> Result<Self, HubError> {
        if let Ok(flat) = serde_json::from_str::<BTreeMap<String, f64>>(body) {
            return Ok(MetricPayload::Flat(flat));
        }
        match serde_json::from_str::<RawBatch>(body) {
            Ok(nested) => Ok(MetricPayload::Nested(nested)),
            Err(err) => Err(HubError::Decode(err.to_string())),
        }
    }
}

/// Accumulation window a hub fills between aggregation ticks. The tick
/// swaps the window out atomically with respect to ingestion because both
/// run on the hub's single-threaded loop.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Window {
    pub batch: RawBatch,
    /// Per-tenant totals contributed by flat payloads only.
    pub tenant_totals: HashMap<String, f64>,
}

impl Window {
    pub fn absorb(&mut self, payload: MetricPayload) {
        match payload {
            MetricPayload::Nested(batch) => self.batch.merge(batch),
            MetricPayload::Flat(totals) => {
                for (tenant, value) in totals {
                    *self.tenant_totals.entry(tenant).or_insert(0.0) += value;
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty() && self.tenant_totals.is_empty()
    }
}
