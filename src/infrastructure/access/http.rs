use async_trait::async_trait;
use serde::Deserialize;

use crate::application::access::Capability;
use crate::application::ports::bucket_access::BucketAccess;
use crate::domain::BucketId;

/// Asks the platform's authorization endpoint which capability a user holds
/// on a bucket. The endpoint answers `{"capability": "none"|"read"|"write"}`.
pub struct HttpBucketAccess {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct AccessResponse {
    capability: String,
}

impl HttpBucketAccess {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl BucketAccess for HttpBucketAccess {
    async fn capability(&self, user_id: &str, bucket: &BucketId) -> anyhow::Result<Capability> {
        let url = format!(
            "{}/internal/access/{}/{}",
            self.base_url.trim_end_matches('/'),
            bucket,
            urlencoding::encode(user_id)
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("access request failed: {e}"))?;
        if !resp.status().is_success() {
            anyhow::bail!("access endpoint returned status {}", resp.status());
        }
        let body: AccessResponse = resp
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("failed to read access body: {e}"))?;
        Ok(match body.capability.as_str() {
            "write" => Capability::Write,
            "read" => Capability::Read,
            _ => Capability::None,
        })
    }
}
