//! HTTPProxy access behind a trait so controller logic can be tested with mocks

use async_trait::async_trait;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use serde_json::{json, Value};

#[cfg(test)]
use mockall::automock;

use fqdnguard_common::crd::HTTPProxy;
use fqdnguard_common::{Error, FIELD_MANAGER};

/// Page size used when listing every HTTPProxy
pub const LIST_PAGE_SIZE: u32 = 500;

/// One page of a cluster-wide list
#[derive(Clone, Debug, Default)]
pub struct ProxyPage {
    /// Objects on this page
    pub items: Vec<HTTPProxy>,
    /// Token for the next page; `None` on the last one
    pub continue_token: Option<String>,
}

/// Read and write HTTPProxy objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProxyStore: Send + Sync {
    /// List one page of HTTPProxies across all namespaces
    async fn list_page(
        &self,
        continue_token: Option<String>,
        limit: u32,
    ) -> Result<ProxyPage, Error>;

    /// Fetch one object; `None` if it no longer exists
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<HTTPProxy>, Error>;

    /// Set `metadata.finalizers` of one object and nothing else.
    ///
    /// The patch carries `resource_version`, so a concurrent change makes the
    /// API server answer 409.
    async fn patch_finalizers(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        finalizers: Vec<String>,
    ) -> Result<(), Error>;
}

/// Merge patch touching only `metadata.finalizers`, guarded by `resourceVersion`
pub fn finalizer_patch(resource_version: Option<&str>, finalizers: &[String]) -> Value {
    let mut metadata = json!({ "finalizers": finalizers });
    if let Some(version) = resource_version {
        metadata["resourceVersion"] = Value::String(version.to_string());
    }
    json!({ "metadata": metadata })
}

/// [`ProxyStore`] backed by the API server
pub struct KubeProxyStore {
    client: Client,
}

impl KubeProxyStore {
    /// Create a store using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProxyStore for KubeProxyStore {
    async fn list_page(
        &self,
        continue_token: Option<String>,
        limit: u32,
    ) -> Result<ProxyPage, Error> {
        let api: Api<HTTPProxy> = Api::all(self.client.clone());
        let mut params = ListParams::default().limit(limit);
        if let Some(token) = continue_token.as_deref() {
            params = params.continue_token(token);
        }

        let list = api.list(&params).await?;
        Ok(ProxyPage {
            items: list.items,
            continue_token: list.metadata.continue_.filter(|t| !t.is_empty()),
        })
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<HTTPProxy>, Error> {
        let api: Api<HTTPProxy> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_finalizers(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let api: Api<HTTPProxy> = Api::namespaced(self.client.clone(), namespace);
        let patch = finalizer_patch(resource_version.as_deref(), &finalizers);
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.patch(name, &params, &Patch::Merge(&patch)).await?;
        Ok(())
    }
}
