//! S3-compatible backend. The OSS variant is the same client pointed at
//! the OSS S3 endpoint. Object keys are hex of the raw key bytes so
//! binary keys survive the object-store key charset.

use super::{Bucket, RawDb};
use crate::error::{Result, SeedError};
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::Client;

pub struct S3Db {
    client: Client,
    bucket_prefix: String,
}

impl S3Db {
    pub async fn connect(
        region: &str,
        endpoint: Option<String>,
        access_key: &str,
        secret_key: &str,
        bucket_prefix: &str,
    ) -> Result<Self> {
        let credentials = Credentials::new(access_key, secret_key, None, None, "permaseed");
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(credentials)
            .force_path_style(true);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        let client = Client::from_conf(builder.build());

        let db = Self {
            client,
            bucket_prefix: bucket_prefix.to_string(),
        };
        db.ensure_buckets(region).await?;
        tracing::info!("object store backend ready, prefix {}", db.bucket_prefix);
        Ok(db)
    }

    fn bucket_name(&self, bucket: Bucket) -> String {
        format!("{}-{}", self.bucket_prefix, bucket.name())
    }

    async fn ensure_buckets(&self, region: &str) -> Result<()> {
        for bucket in Bucket::ALL {
            let name = self.bucket_name(bucket);
            if self
                .client
                .head_bucket()
                .bucket(&name)
                .send()
                .await
                .is_ok()
            {
                continue;
            }

            let mut create = self.client.create_bucket().bucket(&name);
            if region != "us-east-1" {
                create = create.create_bucket_configuration(
                    CreateBucketConfiguration::builder()
                        .location_constraint(BucketLocationConstraint::from(region))
                        .build(),
                );
            }
            if let Err(e) = create.send().await {
                let service_err = e.into_service_error();
                if !service_err.is_bucket_already_owned_by_you()
                    && !service_err.is_bucket_already_exists()
                {
                    return Err(SeedError::Unavailable(format!(
                        "create bucket {name}: {service_err}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RawDb for S3Db {
    async fn put(&self, bucket: Bucket, key: &[u8], value: &[u8]) -> Result<()> {
        self.client
            .put_object()
            .bucket(self.bucket_name(bucket))
            .key(hex::encode(key))
            .body(ByteStream::from(value.to_vec()))
            .send()
            .await
            .map_err(|e| SeedError::Unavailable(format!("s3 put: {e}")))?;
        Ok(())
    }

    async fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Vec<u8>> {
        let output = self
            .client
            .get_object()
            .bucket(self.bucket_name(bucket))
            .key(hex::encode(key))
            .send()
            .await
            .map_err(|e| {
                let service_err = e.into_service_error();
                if service_err.is_no_such_key() {
                    SeedError::NotExist
                } else {
                    SeedError::Unavailable(format!("s3 get: {service_err}"))
                }
            })?;
        let data = output
            .body
            .collect()
            .await
            .map_err(|e| SeedError::Unavailable(format!("s3 body: {e}")))?;
        Ok(data.to_vec())
    }

    async fn delete(&self, bucket: Bucket, key: &[u8]) -> Result<()> {
        self.client
            .delete_object()
            .bucket(self.bucket_name(bucket))
            .key(hex::encode(key))
            .send()
            .await
            .map_err(|e| SeedError::Unavailable(format!("s3 delete: {e}")))?;
        Ok(())
    }

    async fn list_keys(&self, bucket: Bucket) -> Result<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(self.bucket_name(bucket))
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| SeedError::Unavailable(format!("s3 list: {e}")))?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    let raw = hex::decode(key).map_err(|_| {
                        SeedError::Internal(format!("non-hex object key: {key}"))
                    })?;
                    keys.push(raw);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
