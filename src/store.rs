//! `InstanceStore`, `ImageService`: the two external capabilities this
//! driver consumes but does not own (§6). Grounded on the trait-seam style
//! of `examples/tangle-network-blueprint/crates/manager/src/rt/service.rs`
//! and `.../config/ctx.rs`, which hold collaborators behind narrow traits
//! rather than reaching into a concrete database or HTTP client directly.

use crate::error::Result;
use crate::model::{Instance, PowerState, SecurityGroup};
use async_trait::async_trait;
use std::net::{Ipv4Addr, Ipv6Addr};

/// The central relational store, as seen from the driver.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn instance_get_all_by_host(&self, host: &str) -> Result<Vec<Instance>>;
    async fn instance_set_state(
        &self,
        id: u64,
        state: PowerState,
        description: Option<&str>,
    ) -> Result<()>;
    async fn instance_destroy(&self, id: u64) -> Result<()>;
    async fn instance_get_fixed_address(&self, id: u64) -> Result<Option<Ipv4Addr>>;
    async fn instance_get_fixed_address_v6(&self, id: u64) -> Result<Option<Ipv6Addr>>;
    async fn security_group_get_by_instance(&self, id: u64) -> Result<Vec<SecurityGroup>>;
    async fn security_group_rule_get_by_security_group(
        &self,
        sg_id: u64,
    ) -> Result<SecurityGroup>;
    /// Every instance currently bound to `sg_id`, so a rule or membership
    /// change can reprogram each one's filter (§4.4 refresh operations).
    async fn instance_get_all_by_security_group(&self, sg_id: u64) -> Result<Vec<Instance>>;
    async fn network_get_by_instance(&self, id: u64) -> Result<crate::model::NetworkInfo>;
    async fn service_get_all_compute_by_host(&self, host: &str) -> Result<Vec<String>>;
    async fn compute_node_create(&self, record: &crate::model::ComputeNodeReport) -> Result<()>;
    async fn compute_node_update(
        &self,
        host: &str,
        record: &crate::model::ComputeNodeReport,
    ) -> Result<()>;
}

/// The object-store-backed image fetch capability (§6). `fetch` writes the
/// image bytes to `target_path` atomically on success — the implementation
/// is expected to write to a sibling temp file and rename into place, the
/// same discipline `ImageCache` imposes on its own base-file writes.
#[async_trait]
pub trait ImageService: Send + Sync {
    async fn fetch(
        &self,
        image_id: u64,
        target_path: &std::path::Path,
        user: &str,
        project: &str,
    ) -> Result<()>;
}

/// Fetches image bytes over HTTP from an object-store-fronting image
/// service, writing to a sibling temp file and renaming into place so a
/// crash mid-download never leaves a partial file at `target_path` (the
/// same atomicity `ImageCache` relies on from any `ImageService`).
pub struct HttpImageService {
    base_url: String,
    client: reqwest::Client,
}

impl HttpImageService {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ImageService for HttpImageService {
    async fn fetch(
        &self,
        image_id: u64,
        target_path: &std::path::Path,
        user: &str,
        project: &str,
    ) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let url = format!("{}/images/{image_id}", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("X-Requesting-User", user)
            .header("X-Requesting-Project", project)
            .send()
            .await?
            .error_for_status()?;

        let tmp_path = target_path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        let mut response = response;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        tokio::fs::rename(&tmp_path, target_path).await?;
        Ok(())
    }
}

#[cfg(test)]
pub mod fakes {
    use super::{ImageService, InstanceStore};
    use crate::error::Result;
    use crate::model::{ComputeNodeReport, Instance, NetworkInfo, PowerState, SecurityGroup};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryStore {
        pub instances: Mutex<HashMap<u64, Instance>>,
        pub security_groups: Mutex<HashMap<u64, SecurityGroup>>,
        pub networks: Mutex<HashMap<u64, NetworkInfo>>,
    }

    #[async_trait]
    impl InstanceStore for InMemoryStore {
        async fn instance_get_all_by_host(&self, host: &str) -> Result<Vec<Instance>> {
            Ok(self
                .instances
                .lock()
                .await
                .values()
                .filter(|i| i.host == host)
                .cloned()
                .collect())
        }

        async fn instance_set_state(
            &self,
            id: u64,
            state: PowerState,
            description: Option<&str>,
        ) -> Result<()> {
            if let Some(inst) = self.instances.lock().await.get_mut(&id) {
                inst.state = state;
                if let Some(desc) = description {
                    inst.state_description = desc.to_string();
                }
            }
            Ok(())
        }

        async fn instance_destroy(&self, id: u64) -> Result<()> {
            self.instances.lock().await.remove(&id);
            Ok(())
        }

        async fn instance_get_fixed_address(&self, id: u64) -> Result<Option<Ipv4Addr>> {
            Ok(self
                .networks
                .lock()
                .await
                .get(&id)
                .and_then(|n| n.address))
        }

        async fn instance_get_fixed_address_v6(&self, id: u64) -> Result<Option<Ipv6Addr>> {
            Ok(self
                .networks
                .lock()
                .await
                .get(&id)
                .and_then(|n| n.address_v6))
        }

        async fn security_group_get_by_instance(&self, _id: u64) -> Result<Vec<SecurityGroup>> {
            Ok(self.security_groups.lock().await.values().cloned().collect())
        }

        async fn security_group_rule_get_by_security_group(
            &self,
            sg_id: u64,
        ) -> Result<SecurityGroup> {
            self.security_groups
                .lock()
                .await
                .get(&sg_id)
                .cloned()
                .ok_or_else(|| crate::error::Error::not_found(format!("security group {sg_id}")))
        }

        async fn network_get_by_instance(&self, id: u64) -> Result<NetworkInfo> {
            Ok(self.networks.lock().await.get(&id).cloned().unwrap_or_default())
        }

        async fn instance_get_all_by_security_group(&self, _sg_id: u64) -> Result<Vec<Instance>> {
            Ok(self.instances.lock().await.values().cloned().collect())
        }

        async fn service_get_all_compute_by_host(&self, _host: &str) -> Result<Vec<String>> {
            Ok(vec![])
        }

        async fn compute_node_create(&self, _record: &ComputeNodeReport) -> Result<()> {
            Ok(())
        }

        async fn compute_node_update(
            &self,
            _host: &str,
            _record: &ComputeNodeReport,
        ) -> Result<()> {
            Ok(())
        }
    }

    /// An `ImageService` fake that writes deterministic bytes derived from
    /// the image id, so tests can assert on content without a network.
    pub struct FakeImageService;

    #[async_trait]
    impl ImageService for FakeImageService {
        async fn fetch(
            &self,
            image_id: u64,
            target_path: &std::path::Path,
            _user: &str,
            _project: &str,
        ) -> Result<()> {
            let content = format!("image-{image_id}").repeat(64);
            tokio::fs::write(target_path, content).await?;
            Ok(())
        }
    }
}
