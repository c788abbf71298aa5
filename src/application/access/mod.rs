use crate::application::ports::bucket_access::BucketAccess;
use crate::domain::{BucketId, SyncError};

/// Authenticated identity behind one connection, fixed at handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peer {
    /// A browser tab carrying a user session token.
    Browser { user_id: String },
    /// The agent inside one execution container, bound to exactly one bucket.
    ContainerAgent {
        container_id: String,
        bucket: BucketId,
    },
    /// Internal administrative tooling.
    Service,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Capability {
    None,
    Read,
    Write,
}

impl Peer {
    /// Scope check performed on every document-touching message. A
    /// container token never crosses its bound bucket, regardless of what
    /// the external collaborator would grant.
    pub async fn capability(
        &self,
        access: &dyn BucketAccess,
        bucket: &BucketId,
    ) -> Result<Capability, SyncError> {
        match self {
            Peer::Browser { user_id } => {
                let cap = access
                    .capability(user_id, bucket)
                    .await
                    .unwrap_or(Capability::None);
                if cap == Capability::None {
                    Err(SyncError::Unauthorized)
                } else {
                    Ok(cap)
                }
            }
            Peer::ContainerAgent {
                bucket: bound_bucket,
                ..
            } => {
                if bound_bucket == bucket {
                    Ok(Capability::Write)
                } else {
                    Err(SyncError::Unauthorized)
                }
            }
            Peer::Service => Ok(Capability::Write),
        }
    }

    pub fn is_container_agent(&self) -> bool {
        matches!(self, Peer::ContainerAgent { .. })
    }
}

/// Grants every authenticated user full access. Standalone/development
/// wiring for when no authorization endpoint is configured.
pub struct AllowAllAccess;

#[async_trait::async_trait]
impl BucketAccess for AllowAllAccess {
    async fn capability(&self, _user_id: &str, _bucket: &BucketId) -> anyhow::Result<Capability> {
        Ok(Capability::Write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DenyAll;

    #[async_trait::async_trait]
    impl BucketAccess for DenyAll {
        async fn capability(
            &self,
            _user_id: &str,
            _bucket: &BucketId,
        ) -> anyhow::Result<Capability> {
            Ok(Capability::None)
        }
    }

    #[tokio::test]
    async fn container_token_cannot_cross_buckets() {
        let bound = BucketId::new();
        let other = BucketId::new();
        let peer = Peer::ContainerAgent {
            container_id: "c-1".into(),
            bucket: bound,
        };

        assert_eq!(
            peer.capability(&AllowAllAccess, &bound).await.unwrap(),
            Capability::Write
        );
        assert!(matches!(
            peer.capability(&AllowAllAccess, &other).await,
            Err(SyncError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn browser_defers_to_external_collaborator() {
        let bucket = BucketId::new();
        let peer = Peer::Browser {
            user_id: "u-1".into(),
        };

        assert_eq!(
            peer.capability(&AllowAllAccess, &bucket).await.unwrap(),
            Capability::Write
        );
        assert!(matches!(
            peer.capability(&DenyAll, &bucket).await,
            Err(SyncError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn service_tokens_have_full_scope() {
        let bucket = BucketId::new();
        assert_eq!(
            Peer::Service
                .capability(&AllowAllAccess, &bucket)
                .await
                .unwrap(),
            Capability::Write
        );
    }
}
