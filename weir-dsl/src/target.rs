use std::fmt;

use serde::{Deserialize, Serialize};

/// Concrete entity a rule applies to. `G:` groups in rule text are expanded
/// to tenant targets at parse time and never appear here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    Tenant {
        id: String,
    },
    Container {
        tenant: String,
        container: String,
    },
    Object {
        tenant: String,
        container: String,
        object: String,
    },
}

impl Target {
    pub fn tenant(id: impl Into<String>) -> Self {
        Target::Tenant { id: id.into() }
    }

    /// The tenant the target is scoped by, whatever its granularity.
    pub fn tenant_id(&self) -> &str {
        match self {
            Target::Tenant { id } => id,
            Target::Container { tenant, .. } => tenant,
            Target::Object { tenant, .. } => tenant,
        }
    }

    /// Path form used in control-API URLs, e.g. `tenant/container/object`.
    pub fn path(&self) -> String {
        match self {
            Target::Tenant { id } => id.clone(),
            Target::Container { tenant, container } => format!("{}/{}", tenant, container),
            Target::Object {
                tenant,
                container,
                object,
            } => format!("{}/{}/{}", tenant, container, object),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}
