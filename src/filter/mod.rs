//! Network and security-group enforcement (§4.4): one trait, two
//! interchangeable back-ends selected by `config::FirewallDriver`.
//!
//! Grounded on the "dynamic dispatch on firewall driver" design note (§9):
//! a trait/interface with two implementations chosen at startup, no
//! dynamic loading.

pub mod host_filter;
pub mod hypervisor_filter;

use crate::error::Result;
use crate::model::Instance;
use async_trait::async_trait;

/// Applied once per process, idempotently, before any instance is filtered.
#[async_trait]
pub trait FilterEngine: Send + Sync {
    async fn setup_basic_filtering(&self, instance: &Instance) -> Result<()>;
    async fn prepare_instance_filter(&self, instance: &Instance) -> Result<()>;
    async fn apply_instance_filter(&self, instance: &Instance) -> Result<()>;
    async fn unfilter_instance(&self, instance: &Instance) -> Result<()>;
    async fn refresh_security_group_rules(&self, sg_id: u64) -> Result<()>;
    async fn refresh_security_group_members(&self, sg_id: u64) -> Result<()>;
    /// Whether `prepare_instance_filter` has completed for this instance —
    /// used by the live-migration destination readiness wait (§4.5).
    async fn instance_filter_exists(&self, instance: &Instance) -> Result<bool>;
}
