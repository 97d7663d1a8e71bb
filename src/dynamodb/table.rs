//! The slice of the DynamoDB API the driver uses, and its AWS SDK
//! implementation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, DeleteRequest, KeySchemaElement, KeyType,
    ProvisionedThroughput, PutRequest, ScalarAttributeType, TableStatus,
    WriteRequest as AwsWriteRequest,
};
use aws_sdk_dynamodb::Client;
use tracing::info;

use crate::error::{PhysicalError, Result};

const TABLE_READY_POLL: Duration = Duration::from_secs(1);
const TABLE_READY_ATTEMPTS: u32 = 120;

/// One table row. Lock rows also carry `identity` and `expires`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Item {
    pub path: String,
    pub key: String,
    pub value: Vec<u8>,
    pub identity: Option<Vec<u8>>,
    /// Lock expiry in nanoseconds since the Unix epoch.
    pub expires: Option<i64>,
}

impl Item {
    pub fn new(path: impl Into<String>, key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            key: key.into(),
            value,
            ..Self::default()
        }
    }
}

/// One request of a batch write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteRequest {
    Put(Item),
    Delete { path: String, key: String },
}

/// A conditional write of a lock row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockUpdate {
    pub path: String,
    pub key: String,
    pub value: Vec<u8>,
    pub identity: Vec<u8>,
    pub now: i64,
    pub expires: i64,
    /// Create the row if missing; otherwise only refresh an existing one.
    pub create_if_missing: bool,
}

/// DynamoDB operations the driver relies on.
#[async_trait]
pub trait DynamoTable: Send + Sync {
    /// Consistent read of one row.
    async fn get_item(&self, path: &str, key: &str) -> Result<Option<Item>>;

    /// Rows under one partition, ordered by sort key, at most `limit` if set.
    async fn query(&self, path: &str, limit: Option<usize>) -> Result<Vec<Item>>;

    /// Submit at most 25 requests; returns the unprocessed ones.
    async fn batch_write(&self, requests: Vec<WriteRequest>) -> Result<Vec<WriteRequest>>;

    /// Write a lock row if the condition holds. Returns false when the
    /// condition check failed.
    async fn update_lock(&self, update: &LockUpdate) -> Result<bool>;

    /// Delete a lock row if it still carries `identity`. Returns false when
    /// the condition check failed.
    async fn delete_lock(&self, path: &str, key: &str, identity: &[u8]) -> Result<bool>;
}

fn sdk_error<E, R>(op: &str, err: SdkError<E, R>) -> PhysicalError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = format!("dynamodb {op}: {}", DisplayErrorContext(&err));
    match &err {
        SdkError::ServiceError(service) => match service.err().code() {
            Some("ValidationException") | Some("ResourceNotFoundException") => {
                PhysicalError::Protocol(message)
            }
            Some("ItemCollectionSizeLimitExceededException") => PhysicalError::Protocol(message),
            _ => PhysicalError::ConnectionError(message),
        },
        _ => PhysicalError::ConnectionError(message),
    }
}

fn build_error(err: impl std::fmt::Display) -> PhysicalError {
    PhysicalError::Protocol(format!("dynamodb request: {err}"))
}

fn key_attrs(path: &str, key: &str) -> HashMap<String, AttributeValue> {
    HashMap::from([
        ("Path".to_string(), AttributeValue::S(path.to_string())),
        ("Key".to_string(), AttributeValue::S(key.to_string())),
    ])
}

fn item_attrs(item: &Item) -> HashMap<String, AttributeValue> {
    let mut attrs = key_attrs(&item.path, &item.key);
    attrs.insert("Value".into(), AttributeValue::B(Blob::new(item.value.clone())));
    if let Some(identity) = &item.identity {
        attrs.insert("Identity".into(), AttributeValue::B(Blob::new(identity.clone())));
    }
    if let Some(expires) = item.expires {
        attrs.insert("Expires".into(), AttributeValue::N(expires.to_string()));
    }
    attrs
}

fn string_attr(attrs: &HashMap<String, AttributeValue>, name: &str) -> Result<String> {
    attrs
        .get(name)
        .and_then(|v| v.as_s().ok())
        .cloned()
        .ok_or_else(|| PhysicalError::Protocol(format!("dynamodb item without string attribute {name}")))
}

fn item_from_attrs(attrs: &HashMap<String, AttributeValue>) -> Result<Item> {
    let expires = match attrs.get("Expires").and_then(|v| v.as_n().ok()) {
        Some(n) => Some(
            n.parse()
                .map_err(|e| PhysicalError::Protocol(format!("invalid Expires attribute {n:?}: {e}")))?,
        ),
        None => None,
    };
    Ok(Item {
        path: string_attr(attrs, "Path")?,
        key: string_attr(attrs, "Key")?,
        value: attrs
            .get("Value")
            .and_then(|v| v.as_b().ok())
            .map(|b| b.as_ref().to_vec())
            .unwrap_or_default(),
        identity: attrs
            .get("Identity")
            .and_then(|v| v.as_b().ok())
            .map(|b| b.as_ref().to_vec()),
        expires,
    })
}

fn to_aws(request: &WriteRequest) -> Result<AwsWriteRequest> {
    let builder = AwsWriteRequest::builder();
    Ok(match request {
        WriteRequest::Put(item) => builder
            .put_request(
                PutRequest::builder()
                    .set_item(Some(item_attrs(item)))
                    .build()
                    .map_err(build_error)?,
            )
            .build(),
        WriteRequest::Delete { path, key } => builder
            .delete_request(
                DeleteRequest::builder()
                    .set_key(Some(key_attrs(path, key)))
                    .build()
                    .map_err(build_error)?,
            )
            .build(),
    })
}

fn from_aws(request: &AwsWriteRequest) -> Result<WriteRequest> {
    if let Some(put) = request.put_request() {
        return Ok(WriteRequest::Put(item_from_attrs(put.item())?));
    }
    if let Some(delete) = request.delete_request() {
        let key = delete.key();
        return Ok(WriteRequest::Delete {
            path: string_attr(key, "Path")?,
            key: string_attr(key, "Key")?,
        });
    }
    Err(PhysicalError::Protocol("empty unprocessed write request".into()))
}

/// Lock condition: free, ours, or expired, and present when refreshing.
fn lock_condition(create_if_missing: bool) -> String {
    let presence = if create_if_missing {
        "attribute_not_exists(#path) or attribute_not_exists(#key) or "
    } else {
        "attribute_exists(#path) and attribute_exists(#key) and "
    };
    format!("{presence}(attribute_not_exists(#identity) or #identity = :identity or #expires <= :now)")
}

/// [`DynamoTable`] over the AWS SDK.
pub struct AwsTable {
    client: Client,
    table: String,
}

impl AwsTable {
    pub fn new(client: Client, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }

    /// Create the table with a `Path`/`Key` schema unless it already
    /// exists, then wait for it to become active.
    pub async fn ensure_exists(&self, read_capacity: i64, write_capacity: i64) -> Result<()> {
        match self.client.describe_table().table_name(&self.table).send().await {
            Ok(_) => return Ok(()),
            Err(err) => {
                let missing = err
                    .as_service_error()
                    .map(|e| e.is_resource_not_found_exception())
                    .unwrap_or(false);
                if !missing {
                    return Err(sdk_error("describe table", err));
                }
            }
        }

        info!(table = %self.table, read_capacity, write_capacity, "Creating DynamoDB table");
        self.client
            .create_table()
            .table_name(&self.table)
            .provisioned_throughput(
                ProvisionedThroughput::builder()
                    .read_capacity_units(read_capacity)
                    .write_capacity_units(write_capacity)
                    .build()
                    .map_err(build_error)?,
            )
            .key_schema(
                KeySchemaElement::builder()
                    .attribute_name("Path")
                    .key_type(KeyType::Hash)
                    .build()
                    .map_err(build_error)?,
            )
            .key_schema(
                KeySchemaElement::builder()
                    .attribute_name("Key")
                    .key_type(KeyType::Range)
                    .build()
                    .map_err(build_error)?,
            )
            .attribute_definitions(
                AttributeDefinition::builder()
                    .attribute_name("Path")
                    .attribute_type(ScalarAttributeType::S)
                    .build()
                    .map_err(build_error)?,
            )
            .attribute_definitions(
                AttributeDefinition::builder()
                    .attribute_name("Key")
                    .attribute_type(ScalarAttributeType::S)
                    .build()
                    .map_err(build_error)?,
            )
            .send()
            .await
            .map_err(|e| sdk_error("create table", e))?;

        for _ in 0..TABLE_READY_ATTEMPTS {
            let described = self
                .client
                .describe_table()
                .table_name(&self.table)
                .send()
                .await
                .map_err(|e| sdk_error("describe table", e))?;
            let status = described.table().and_then(|t| t.table_status());
            if status == Some(&TableStatus::Active) {
                return Ok(());
            }
            tokio::time::sleep(TABLE_READY_POLL).await;
        }
        Err(PhysicalError::NotReady(format!(
            "dynamodb table {} did not become active",
            self.table
        )))
    }
}

#[async_trait]
impl DynamoTable for AwsTable {
    async fn get_item(&self, path: &str, key: &str) -> Result<Option<Item>> {
        let out = self
            .client
            .get_item()
            .table_name(&self.table)
            .consistent_read(true)
            .set_key(Some(key_attrs(path, key)))
            .send()
            .await
            .map_err(|e| sdk_error("get item", e))?;
        out.item().map(item_from_attrs).transpose()
    }

    async fn query(&self, path: &str, limit: Option<usize>) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        let mut start_key = None;
        loop {
            let mut request = self
                .client
                .query()
                .table_name(&self.table)
                .consistent_read(true)
                .key_condition_expression("#path = :path")
                .expression_attribute_names("#path", "Path")
                .expression_attribute_values(":path", AttributeValue::S(path.to_string()))
                .set_exclusive_start_key(start_key.take());
            if let Some(limit) = limit {
                request = request.limit((limit - items.len().min(limit)) as i32);
            }
            let out = request.send().await.map_err(|e| sdk_error("query", e))?;
            for attrs in out.items() {
                items.push(item_from_attrs(attrs)?);
            }
            let done = limit.map(|l| items.len() >= l).unwrap_or(false);
            match out.last_evaluated_key() {
                Some(last) if !done => start_key = Some(last.clone()),
                _ => break,
            }
        }
        Ok(items)
    }

    async fn batch_write(&self, requests: Vec<WriteRequest>) -> Result<Vec<WriteRequest>> {
        let batch = requests.iter().map(to_aws).collect::<Result<Vec<_>>>()?;
        let out = self
            .client
            .batch_write_item()
            .request_items(&self.table, batch)
            .send()
            .await
            .map_err(|e| sdk_error("batch write", e))?;
        match out.unprocessed_items().and_then(|m| m.get(&self.table)) {
            Some(unprocessed) => unprocessed.iter().map(from_aws).collect(),
            None => Ok(Vec::new()),
        }
    }

    async fn update_lock(&self, update: &LockUpdate) -> Result<bool> {
        let result = self
            .client
            .update_item()
            .table_name(&self.table)
            .set_key(Some(key_attrs(&update.path, &update.key)))
            .update_expression("SET #value = :value, #identity = :identity, #expires = :expires")
            .condition_expression(lock_condition(update.create_if_missing))
            .expression_attribute_names("#path", "Path")
            .expression_attribute_names("#key", "Key")
            .expression_attribute_names("#identity", "Identity")
            .expression_attribute_names("#expires", "Expires")
            .expression_attribute_names("#value", "Value")
            .expression_attribute_values(":identity", AttributeValue::B(Blob::new(update.identity.clone())))
            .expression_attribute_values(":value", AttributeValue::B(Blob::new(update.value.clone())))
            .expression_attribute_values(":now", AttributeValue::N(update.now.to_string()))
            .expression_attribute_values(":expires", AttributeValue::N(update.expires.to_string()))
            .send()
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_conditional_check_failed_exception())
                    .unwrap_or(false) =>
            {
                Ok(false)
            }
            Err(err) => Err(sdk_error("update lock", err)),
        }
    }

    async fn delete_lock(&self, path: &str, key: &str, identity: &[u8]) -> Result<bool> {
        let result = self
            .client
            .delete_item()
            .table_name(&self.table)
            .set_key(Some(key_attrs(path, key)))
            .condition_expression("#identity = :identity")
            .expression_attribute_names("#identity", "Identity")
            .expression_attribute_values(":identity", AttributeValue::B(Blob::new(identity.to_vec())))
            .send()
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_conditional_check_failed_exception())
                    .unwrap_or(false) =>
            {
                Ok(false)
            }
            Err(err) => Err(sdk_error("delete lock", err)),
        }
    }
}
