use async_trait::async_trait;

use crate::application::access::Capability;
use crate::domain::BucketId;

/// External authorization collaborator. The engine asks, the platform
/// answers; ownership and grants live outside this repository.
#[async_trait]
pub trait BucketAccess: Send + Sync {
    async fn capability(&self, user_id: &str, bucket: &BucketId) -> anyhow::Result<Capability>;
}
