use anyhow::{Context, anyhow};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::operation::create_bucket::CreateBucketError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_bucket::HeadBucketError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::{Client, error::SdkError};
use tokio::io::AsyncReadExt;

use crate::application::ports::snapshot_store::SnapshotStore;
use crate::bootstrap::config::Config;
use crate::domain::{BucketId, DocumentKey, SyncError};

const TOMBSTONE_MARKER: &str = "tombstone";

/// Object-store backend. One S3 object per `(bucket, path)` under the
/// logical bucket's prefix; a zero-byte marker object carries the
/// tombstone. Single-object PUTs keep writes atomic for observers.
pub struct S3SnapshotStore {
    client: Client,
    bucket: String,
}

impl S3SnapshotStore {
    pub async fn new(cfg: &Config) -> anyhow::Result<Self> {
        let bucket = cfg
            .s3_bucket
            .clone()
            .context("S3 bucket must be configured when using the S3 snapshot backend")?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest());

        if let Some(region) = &cfg.s3_region {
            loader = loader.region(Region::new(region.clone()));
        }

        let shared_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared_config);

        if let (Some(access), Some(secret)) = (&cfg.s3_access_key, &cfg.s3_secret_key) {
            let creds = Credentials::new(
                access.clone(),
                secret.clone(),
                None,
                None,
                "codesync-s3-static",
            );
            builder = builder.credentials_provider(creds);
        }

        if let Some(endpoint) = &cfg.s3_endpoint {
            builder = builder.endpoint_url(endpoint.clone());
        }

        if cfg.s3_use_path_style {
            builder = builder.force_path_style(true);
        }

        let client = Client::from_conf(builder.build());

        ensure_bucket(&client, &bucket).await?;

        Ok(Self { client, bucket })
    }

    fn files_prefix(bucket: &BucketId) -> String {
        format!("{bucket}/files/")
    }

    fn object_key(key: &DocumentKey) -> String {
        format!("{}{}", Self::files_prefix(key.bucket()), key.path())
    }

    fn marker_key(bucket: &BucketId) -> String {
        format!("{bucket}/{TOMBSTONE_MARKER}")
    }

    async fn object_exists(&self, key: &str) -> anyhow::Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(service_err)) => {
                let head_err: &HeadObjectError = service_err.err();
                if head_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(anyhow!("head_object error for {}: {}", key, head_err))
                }
            }
            Err(other) => Err(anyhow!("head_object failed for {}: {}", key, other)),
        }
    }

    async fn list_keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = &continuation {
                req = req.continuation_token(token.clone());
            }
            let page = req
                .send()
                .await
                .with_context(|| format!("failed to list objects under {prefix}"))?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
            match page.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl SnapshotStore for S3SnapshotStore {
    async fn load_text(&self, key: &DocumentKey) -> anyhow::Result<String> {
        let object_key = Self::object_key(key);
        let object = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
        {
            Ok(object) => object,
            Err(SdkError::ServiceError(service_err)) => {
                let get_err: &GetObjectError = service_err.err();
                if get_err.is_no_such_key() {
                    return Ok(String::new());
                }
                return Err(anyhow!("get_object error for {}: {}", object_key, get_err));
            }
            Err(other) => {
                return Err(anyhow!("get_object failed for {}: {}", object_key, other));
            }
        };
        let mut reader = object.body.into_async_read();
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        String::from_utf8(data).with_context(|| format!("snapshot for {key} is not valid UTF-8"))
    }

    async fn save_text(&self, key: &DocumentKey, text: &str) -> anyhow::Result<()> {
        if self.is_tombstoned(key.bucket()).await? {
            return Err(anyhow::Error::new(SyncError::BucketClosed(*key.bucket())));
        }
        let object_key = Self::object_key(key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .body(ByteStream::from(text.as_bytes().to_vec()))
            .send()
            .await
            .with_context(|| format!("failed to upload object {object_key}"))?;
        Ok(())
    }

    async fn list_paths(&self, bucket: &BucketId) -> anyhow::Result<Vec<String>> {
        let prefix = Self::files_prefix(bucket);
        let mut paths: Vec<String> = self
            .list_keys(&prefix)
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .filter(|path| !path.is_empty())
            .collect();
        paths.sort();
        Ok(paths)
    }

    async fn clone_bucket(&self, src: &BucketId) -> anyhow::Result<BucketId> {
        let dst = BucketId::new();
        let src_prefix = Self::files_prefix(src);
        let dst_prefix = Self::files_prefix(&dst);
        for src_key in self.list_keys(&src_prefix).await? {
            let Some(rel) = src_key.strip_prefix(&src_prefix) else {
                continue;
            };
            let dst_key = format!("{dst_prefix}{rel}");
            let copy_source = format!("{}/{}", &self.bucket, src_key);
            self.client
                .copy_object()
                .bucket(&self.bucket)
                .key(&dst_key)
                .copy_source(urlencoding::encode(&copy_source))
                .send()
                .await
                .with_context(|| format!("failed to copy {src_key} to {dst_key}"))?;
        }
        Ok(dst)
    }

    async fn tombstone(&self, bucket: &BucketId) -> anyhow::Result<()> {
        let marker = Self::marker_key(bucket);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&marker)
            .body(ByteStream::from_static(b""))
            .send()
            .await
            .with_context(|| format!("failed to write tombstone marker {marker}"))?;
        Ok(())
    }

    async fn is_tombstoned(&self, bucket: &BucketId) -> anyhow::Result<bool> {
        self.object_exists(&Self::marker_key(bucket)).await
    }
}

async fn ensure_bucket(client: &Client, bucket: &str) -> anyhow::Result<()> {
    match client.head_bucket().bucket(bucket).send().await {
        Ok(_) => return Ok(()),
        Err(SdkError::ServiceError(service_err)) => {
            if !matches!(service_err.err(), HeadBucketError::NotFound(_)) {
                return Err(anyhow!(service_err.err().to_string()));
            }
        }
        Err(err) => return Err(anyhow!(err.to_string())),
    }

    match client.create_bucket().bucket(bucket).send().await {
        Ok(_) => Ok(()),
        Err(SdkError::ServiceError(service_err)) => match service_err.err() {
            CreateBucketError::BucketAlreadyOwnedByYou(_) => Ok(()),
            CreateBucketError::BucketAlreadyExists(_) => Ok(()),
            other => Err(anyhow!(other.to_string())),
        },
        Err(err) => Err(anyhow!(err.to_string())),
    }
}
