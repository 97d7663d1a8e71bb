//! Client construction for the object-store drivers.
//!
//! Every setting may come from the configuration map or, where noted, an
//! environment variable which takes precedence.

use std::sync::Arc;

use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::gcp::GoogleCloudStorageBuilder;
use tracing::info;

use super::ObjectStoreBackend;
use crate::config::BackendConfig;
use crate::error::{PhysicalError, Result};

const DEFAULT_S3_REGION: &str = "us-east-1";

fn build_error(driver: &str, err: object_store::Error) -> PhysicalError {
    PhysicalError::Config(format!("{driver}: {err}"))
}

/// S3 or an S3-compatible service.
///
/// `bucket` (`AWS_S3_BUCKET`) is required. Credentials fall back to the
/// standard AWS environment when `access_key`/`secret_key` are unset.
pub fn new_s3(conf: &BackendConfig) -> Result<ObjectStoreBackend> {
    let bucket = conf.require_or_env("bucket", "AWS_S3_BUCKET")?;
    let region = conf
        .get_or_env("region", "AWS_REGION")
        .or_else(|| std::env::var("AWS_DEFAULT_REGION").ok())
        .unwrap_or_else(|| DEFAULT_S3_REGION.to_string());

    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(&bucket)
        .with_region(&region);
    if let Some(access_key) = conf.get("access_key") {
        builder = builder.with_access_key_id(access_key);
    }
    if let Some(secret_key) = conf.get("secret_key") {
        builder = builder.with_secret_access_key(secret_key);
    }
    if let Some(token) = conf.get("session_token") {
        builder = builder.with_token(token);
    }
    if let Some(endpoint) = conf.get_or_env("endpoint", "AWS_S3_ENDPOINT") {
        builder = builder
            .with_allow_http(endpoint.starts_with("http://"))
            .with_endpoint(endpoint);
    }

    let store = builder.build().map_err(|e| build_error("s3", e))?;
    info!(bucket = %bucket, region = %region, "Opened S3 backend");
    Ok(ObjectStoreBackend::new(
        Arc::new(store),
        "s3",
        conf.max_parallel()?,
    ))
}

/// Azure blob storage. `container`, `accountName` and `accountKey` are
/// required (`AZURE_BLOB_CONTAINER`, `AZURE_ACCOUNT_NAME`,
/// `AZURE_ACCOUNT_KEY`).
pub fn new_azure(conf: &BackendConfig) -> Result<ObjectStoreBackend> {
    let container = conf.require_or_env("container", "AZURE_BLOB_CONTAINER")?;
    let account = conf.require_or_env("accountName", "AZURE_ACCOUNT_NAME")?;
    let key = conf.require_or_env("accountKey", "AZURE_ACCOUNT_KEY")?;

    let store = MicrosoftAzureBuilder::new()
        .with_container_name(&container)
        .with_account(&account)
        .with_access_key(key)
        .build()
        .map_err(|e| build_error("azure", e))?;
    info!(container = %container, account = %account, "Opened Azure backend");
    Ok(ObjectStoreBackend::new(
        Arc::new(store),
        "azure",
        conf.max_parallel()?,
    ))
}

/// Google Cloud Storage. `bucket` (`GOOGLE_STORAGE_BUCKET`) and
/// `credentials_file` (`GOOGLE_APPLICATION_CREDENTIALS`) are required.
pub fn new_gcs(conf: &BackendConfig) -> Result<ObjectStoreBackend> {
    let bucket = conf.require_or_env("bucket", "GOOGLE_STORAGE_BUCKET")?;
    let credentials = conf.require_or_env("credentials_file", "GOOGLE_APPLICATION_CREDENTIALS")?;

    let store = GoogleCloudStorageBuilder::new()
        .with_bucket_name(&bucket)
        .with_service_account_path(credentials)
        .build()
        .map_err(|e| build_error("gcs", e))?;
    info!(bucket = %bucket, "Opened GCS backend");
    Ok(ObjectStoreBackend::new(
        Arc::new(store),
        "gcs",
        conf.max_parallel()?,
    ))
}
