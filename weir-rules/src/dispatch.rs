use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use weir_core::catalog::Catalog;
use weir_dsl::{ActionSpec, Target};

use crate::error::DispatchError;

/// Seam between rule actors and the cluster control API. `set` returns the
/// opaque policy-instance identifier the later `delete` is keyed by.
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn set(&self, target: &Target, action: &ActionSpec) -> Result<String, DispatchError>;

    async fn delete(&self, target: &Target, instance_id: &str) -> Result<(), DispatchError>;
}

#[derive(Debug, Serialize)]
struct DeployRequest<'a> {
    object_type: Option<&'a str>,
    object_size: Option<String>,
    params: &'a BTreeMap<String, String>,
}

/// Typed HTTP client for the cluster control API. Deploy routes and filter
/// identifiers are resolved through the filter catalog.
#[derive(Clone)]
pub struct ControlApiClient {
    http: reqwest::Client,
    base_url: Url,
    auth_token: Option<String>,
    catalog: Catalog,
}

impl ControlApiClient {
    /// Creates a new client bound to the provided base URL.
    pub fn new(
        base_url: &str,
        auth_token: Option<String>,
        catalog: Catalog,
    ) -> Result<Self, DispatchError> {
        let mut url = Url::parse(base_url).map_err(|err| DispatchError::InvalidUrl {
            url: base_url.to_string(),
            source: err,
        })?;

        if !url.path().ends_with('/') {
            let mut path = url.path().trim_end_matches('/').to_string();
            path.push('/');
            url.set_path(&path);
        }

        Ok(Self {
            http: reqwest::Client::new(),
            base_url: url,
            auth_token,
            catalog,
        })
    }

    fn join(&self, path: &str) -> Result<Url, DispatchError> {
        self.base_url
            .join(path)
            .map_err(|err| DispatchError::InvalidUrl {
                url: format!("{}{}", self.base_url, path),
                source: err,
            })
    }

    fn with_token(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.header("X-Auth-Token", token),
            None => request,
        }
    }
}

#[async_trait]
impl ActionDispatcher for ControlApiClient {
    /// Deploys the filter on the target:
    /// `PUT <controller>/<activation route>/<target>/deploy/<identifier>`,
    /// with the route and identifier taken from the filter catalog entry.
    async fn set(&self, target: &Target, action: &ActionSpec) -> Result<String, DispatchError> {
        let (route, deployed) = match self.catalog.filter(&action.filter) {
            Some(spec) => (spec.activation_url, spec.identifier),
            None => {
                warn!(filter = %action.filter, "filter missing from catalog, deploying by rule name");
                ("filters".to_string(), action.filter.clone())
            }
        };
        let url = self.join(&format!(
            "{}/{}/deploy/{}",
            route.trim_matches('/'),
            target.path(),
            deployed
        ))?;

        let object_filter = action.object_filter.clone().unwrap_or_default();
        let request = DeployRequest {
            object_type: object_filter.object_type.as_deref(),
            object_size: object_filter
                .object_size
                .map(|(op, size)| format!("{} {}", op, size)),
            params: &action.params,
        };

        let response = self
            .with_token(self.http.put(url).json(&request))
            .send()
            .await
            .map_err(|err| DispatchError::Http(err.to_string()))?;

        // Any 2xx counts as success; everything else is a dispatch failure
        // the caller retries on the next qualifying edge.
        if !response.status().is_success() {
            return Err(DispatchError::UnexpectedStatus {
                status: response.status(),
            });
        }

        let instance_id = response
            .text()
            .await
            .map_err(|err| DispatchError::Http(err.to_string()))?;
        let instance_id = instance_id.trim().trim_matches('"').to_string();
        debug!(target = %target, filter = %action.filter, %deployed, %instance_id, "filter deployed");
        Ok(instance_id)
    }

    /// Undeploys a previously deployed policy instance:
    /// `DELETE <controller>/policies/static/<target>:<instance_id>`.
    async fn delete(&self, target: &Target, instance_id: &str) -> Result<(), DispatchError> {
        let url = self.join(&format!("policies/static/{}:{}", target.path(), instance_id))?;

        let response = self
            .with_token(self.http.delete(url))
            .send()
            .await
            .map_err(|err| DispatchError::Http(err.to_string()))?;

        if !response.status().is_success() {
            return Err(DispatchError::UnexpectedStatus {
                status: response.status(),
            });
        }
        debug!(target = %target, %instance_id, "filter undeployed");
        Ok(())
    }
}
