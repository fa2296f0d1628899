//! S3-compatible storage client
//!
//! Wraps the AWS SDK for S3-compatible storage access. One client is bound
//! to one bucket; each upload mount gets its own.

use std::ops::Range;

use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::{DisplayErrorContext, SdkError},
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart, MetadataDirective},
    Client,
};
use bytes::{Bytes, BytesMut};
use chrono::DateTime;
use futures::future::try_join_all;

use crate::config::StorageConfig;
use crate::error::{AppError, Result, StorageError};

use super::types::{ListOptions, ObjectList, ObjectMetadata, StorageObject};

/// Smallest part S3 accepts in a multipart upload (except the last part)
pub const MIN_MULTIPART_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Concurrent deletes issued by [`S3Client::delete_objects_with_prefix`]
const DELETE_BATCH: usize = 32;

/// S3-compatible storage client
#[derive(Clone)]
pub struct S3Client {
    client: Client,
    bucket: String,
}

impl S3Client {
    /// Create a new S3 client for `bucket` from configuration
    pub async fn new(config: &StorageConfig, bucket: &str) -> Result<Self> {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "upload-server",
        );

        let region = config
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint)
            .region(Region::new(region))
            .credentials_provider(credentials)
            .force_path_style(true) // Required for MinIO and other S3-compatible services
            .build();

        let client = Client::from_conf(s3_config);

        // Test connection by checking if bucket exists
        let bucket = bucket.to_string();
        match client.head_bucket().bucket(&bucket).send().await {
            Ok(_) => {
                tracing::info!("Connected to S3 bucket: {}", bucket);
            }
            Err(e) => {
                tracing::warn!(
                    "Could not verify bucket {}: {}. Will attempt operations anyway.",
                    bucket,
                    DisplayErrorContext(&e)
                );
            }
        }

        Ok(Self { client, bucket })
    }

    /// List objects in the bucket
    pub async fn list_objects(&self, options: ListOptions) -> Result<ObjectList> {
        let mut request = self.client.list_objects_v2().bucket(&self.bucket);

        if let Some(prefix) = &options.prefix {
            request = request.prefix(prefix);
        }

        if let Some(max_keys) = options.max_keys {
            request = request.max_keys(max_keys);
        }

        if let Some(token) = options.continuation_token {
            request = request.continuation_token(token);
        }

        let prefix = options.prefix.unwrap_or_default();
        let response = request
            .send()
            .await
            .map_err(|e| map_sdk_error("list", &prefix, e))?;

        let objects: Vec<ObjectMetadata> = response
            .contents()
            .iter()
            .map(|obj| ObjectMetadata {
                key: obj.key().unwrap_or_default().to_string(),
                size: obj.size().unwrap_or(0),
                last_modified: obj
                    .last_modified()
                    .and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())),
                etag: obj.e_tag().map(|s| s.to_string()),
            })
            .collect();

        Ok(ObjectList {
            objects,
            continuation_token: response.next_continuation_token().map(|s| s.to_string()),
            is_truncated: response.is_truncated().unwrap_or(false),
        })
    }

    /// List all objects with a given prefix (handles pagination)
    pub async fn list_all_objects(&self, prefix: &str) -> Result<Vec<ObjectMetadata>> {
        let mut all_objects = Vec::new();
        let mut continuation_token = None;

        loop {
            let mut options = ListOptions::new().with_max_keys(1000).with_prefix(prefix);

            if let Some(token) = continuation_token.take() {
                options = options.with_continuation_token(token);
            }

            let result = self.list_objects(options).await?;
            all_objects.extend(result.objects);

            if !result.is_truncated {
                break;
            }

            continuation_token = result.continuation_token;
        }

        Ok(all_objects)
    }

    /// Whether at least one object exists under `prefix`
    pub async fn prefix_has_objects(&self, prefix: &str) -> Result<bool> {
        let list = self
            .list_objects(ListOptions::new().with_prefix(prefix).with_max_keys(1))
            .await?;
        Ok(!list.objects.is_empty())
    }

    /// Get object metadata (HEAD request)
    pub async fn head_object(&self, key: &str) -> Result<ObjectMetadata> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error("head", key, e))?;

        Ok(ObjectMetadata {
            key: key.to_string(),
            size: response.content_length().unwrap_or(0),
            last_modified: response
                .last_modified()
                .and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())),
            etag: response.e_tag().map(|s| s.to_string()),
        })
    }

    /// Check if an object exists
    pub async fn object_exists(&self, key: &str) -> Result<bool> {
        match self.head_object(key).await {
            Ok(_) => Ok(true),
            Err(AppError::Storage(StorageError::ObjectNotFound(_))) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Get an object's data
    pub async fn get_object(&self, key: &str) -> Result<StorageObject> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error("get", key, e))?;

        let metadata = ObjectMetadata {
            key: key.to_string(),
            size: response.content_length().unwrap_or(0),
            last_modified: response
                .last_modified()
                .and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())),
            etag: response.e_tag().map(|s| s.to_string()),
        };

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::ConnectionFailed(format!("Failed to read object body: {}", e)))?
            .into_bytes();

        Ok(StorageObject { metadata, data })
    }

    /// Upload an object, replacing any existing object at `key`
    pub async fn put_object(&self, key: &str, data: Bytes, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| map_sdk_error("put", key, e))?;

        Ok(())
    }

    /// Delete a single object. Deleting a missing key is not an error.
    pub async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error("delete", key, e))?;

        Ok(())
    }

    /// Delete every object under `prefix`, returning how many were removed
    pub async fn delete_objects_with_prefix(&self, prefix: &str) -> Result<usize> {
        let objects = self.list_all_objects(prefix).await?;
        let count = objects.len();

        for batch in objects.chunks(DELETE_BATCH) {
            try_join_all(batch.iter().map(|obj| self.delete_object(&obj.key))).await?;
        }

        Ok(count)
    }

    /// Assemble `sources` (in order) into a single object at `destination`.
    ///
    /// A single source is copied server-side. Otherwise a multipart upload is
    /// built where sources of at least the minimum part size are copied
    /// server-side and runs of smaller sources are downloaded into buffers
    /// of roughly that size, so memory stays bounded by one buffer plus one
    /// source.
    pub async fn compose_objects(
        &self,
        sources: &[ObjectMetadata],
        destination: &str,
        content_type: &str,
    ) -> Result<()> {
        match sources {
            [] => self.put_object(destination, Bytes::new(), content_type).await,
            [single] => self.copy_object(&single.key, destination, content_type).await,
            _ => self.multipart_compose(sources, destination, content_type).await,
        }
    }

    /// Server-side copy of one object
    pub async fn copy_object(&self, source: &str, destination: &str, content_type: &str) -> Result<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(destination)
            .copy_source(copy_source(&self.bucket, source))
            .content_type(content_type)
            .metadata_directive(MetadataDirective::Replace)
            .send()
            .await
            .map_err(|e| map_sdk_error("copy", source, e))?;

        Ok(())
    }

    async fn multipart_compose(
        &self,
        sources: &[ObjectMetadata],
        destination: &str,
        content_type: &str,
    ) -> Result<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(destination)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| map_sdk_error("create multipart upload", destination, e))?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| {
                StorageError::SdkError(format!("No upload id returned for {}", destination))
            })?
            .to_string();

        let plan = plan_parts(sources, MIN_MULTIPART_PART_SIZE);
        tracing::debug!(
            key = %destination,
            sources = sources.len(),
            parts = plan.len(),
            "Composing multipart object"
        );

        match self.write_parts(sources, &plan, destination, &upload_id).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(destination)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| map_sdk_error("complete multipart upload", destination, e))?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(destination)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!(
                        key = %destination,
                        error = %DisplayErrorContext(&abort),
                        "Failed to abort multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    /// Write each planned part in order; one buffer is alive at a time
    async fn write_parts(
        &self,
        sources: &[ObjectMetadata],
        plan: &[PlannedPart],
        destination: &str,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>> {
        let mut completed = Vec::with_capacity(plan.len());

        for (index, part) in plan.iter().enumerate() {
            let part_number = index as i32 + 1;

            let etag = match part {
                PlannedPart::Copy(source) => {
                    let key = &sources[*source].key;
                    let response = self
                        .client
                        .upload_part_copy()
                        .bucket(&self.bucket)
                        .key(destination)
                        .upload_id(upload_id)
                        .part_number(part_number)
                        .copy_source(copy_source(&self.bucket, key))
                        .send()
                        .await
                        .map_err(|e| map_sdk_error("copy part", key, e))?;

                    response
                        .copy_part_result()
                        .and_then(|r| r.e_tag())
                        .map(|s| s.to_string())
                }
                PlannedPart::Buffer(range) => {
                    let capacity: i64 = sources[range.clone()].iter().map(|obj| obj.size.max(0)).sum();
                    let mut buffer = BytesMut::with_capacity(capacity as usize);
                    for source in &sources[range.clone()] {
                        let object = self.get_object(&source.key).await?;
                        buffer.extend_from_slice(&object.data);
                    }

                    let response = self
                        .client
                        .upload_part()
                        .bucket(&self.bucket)
                        .key(destination)
                        .upload_id(upload_id)
                        .part_number(part_number)
                        .body(ByteStream::from(buffer.freeze()))
                        .send()
                        .await
                        .map_err(|e| map_sdk_error("upload part", destination, e))?;

                    response.e_tag().map(|s| s.to_string())
                }
            };

            completed.push(
                CompletedPart::builder()
                    .set_e_tag(etag)
                    .part_number(part_number)
                    .build(),
            );
        }

        Ok(completed)
    }
}

/// One part of a composed multipart object
#[derive(Debug, Clone, PartialEq, Eq)]
enum PlannedPart {
    /// Server-side copy of a single source
    Copy(usize),
    /// Sources downloaded and uploaded together
    Buffer(Range<usize>),
}

/// Group `sources` into multipart parts.
///
/// A source of at least `min_part` bytes that starts a part is copied as is.
/// Smaller sources accumulate until the buffer reaches `min_part`; only the
/// trailing buffer may be smaller.
fn plan_parts(sources: &[ObjectMetadata], min_part: u64) -> Vec<PlannedPart> {
    let mut plan = Vec::new();
    let mut pending: Option<(usize, u64)> = None;

    for (index, source) in sources.iter().enumerate() {
        let size = source.size.max(0) as u64;

        match pending {
            None if size >= min_part => plan.push(PlannedPart::Copy(index)),
            None => pending = Some((index, size)),
            Some((start, buffered)) => pending = Some((start, buffered + size)),
        }

        if let Some((start, buffered)) = pending {
            if buffered >= min_part {
                plan.push(PlannedPart::Buffer(start..index + 1));
                pending = None;
            }
        }
    }

    if let Some((start, _)) = pending {
        plan.push(PlannedPart::Buffer(start..sources.len()));
    }

    plan
}

/// `bucket/key` with each key segment percent-encoded, as `x-amz-copy-source` expects
fn copy_source(bucket: &str, key: &str) -> String {
    let encoded: Vec<String> = key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!("{}/{}", bucket, encoded.join("/"))
}

fn map_sdk_error<E, R>(action: &str, key: &str, err: SdkError<E, R>) -> AppError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    if matches!(err, SdkError::TimeoutError(_) | SdkError::DispatchFailure(_)) {
        return StorageError::ConnectionFailed(format!(
            "Failed to {} {}: {}",
            action,
            key,
            DisplayErrorContext(&err)
        ))
        .into();
    }

    let message = DisplayErrorContext(&err).to_string();
    let error = if message.contains("NoSuchBucket") {
        StorageError::BucketNotFound(message)
    } else if message.contains("NoSuchKey") || message.contains("NotFound") || message.contains("404") {
        StorageError::ObjectNotFound(key.to_string())
    } else if message.contains("AccessDenied") || message.contains("403") {
        StorageError::AccessDenied(key.to_string())
    } else {
        StorageError::SdkError(format!("Failed to {} {}: {}", action, key, message))
    };

    error.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_options_builder() {
        let options = ListOptions::new()
            .with_prefix("media-files/")
            .with_max_keys(1);

        assert_eq!(options.prefix, Some("media-files/".to_string()));
        assert_eq!(options.max_keys, Some(1));
        assert_eq!(options.continuation_token, None);
    }

    fn objects(sizes: &[i64]) -> Vec<ObjectMetadata> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, size)| ObjectMetadata {
                key: format!("part-{}", i),
                size: *size,
                last_modified: None,
                etag: None,
            })
            .collect()
    }

    #[test]
    fn test_plan_copies_large_parts() {
        let plan = plan_parts(&objects(&[10, 10, 3]), 10);
        assert_eq!(
            plan,
            vec![
                PlannedPart::Copy(0),
                PlannedPart::Copy(1),
                PlannedPart::Buffer(2..3)
            ]
        );
    }

    #[test]
    fn test_plan_groups_small_parts() {
        // 200 one-unit chunks with a minimum part of 64 units
        let plan = plan_parts(&objects(&[1; 200]), 64);
        assert_eq!(
            plan,
            vec![
                PlannedPart::Buffer(0..64),
                PlannedPart::Buffer(64..128),
                PlannedPart::Buffer(128..192),
                PlannedPart::Buffer(192..200),
            ]
        );
    }

    #[test]
    fn test_plan_every_part_but_last_meets_minimum() {
        let sources = objects(&[3, 12, 4, 4, 4, 20, 1, 9]);
        let plan = plan_parts(&sources, 10);

        let sizes: Vec<i64> = plan
            .iter()
            .map(|part| match part {
                PlannedPart::Copy(i) => sources[*i].size,
                PlannedPart::Buffer(range) => sources[range.clone()].iter().map(|o| o.size).sum(),
            })
            .collect();

        assert_eq!(sizes.iter().sum::<i64>(), 57);
        assert!(sizes[..sizes.len() - 1].iter().all(|size| *size >= 10));
        assert_eq!(plan[0], PlannedPart::Buffer(0..2));
        assert_eq!(plan[2], PlannedPart::Copy(5));
    }

    #[test]
    fn test_copy_source_encodes_segments() {
        assert_eq!(
            copy_source("bucket", ".parts/media-files/p 1/00000000000000000000.part"),
            "bucket/.parts/media-files/p%201/00000000000000000000.part"
        );
    }
}
