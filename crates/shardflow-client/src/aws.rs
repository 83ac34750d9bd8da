//! AWS-backed gateways: Kinesis as the stream service, DynamoDB as the
//! state store.
//!
//! Enable with the `aws` feature:
//!
//! ```toml
//! shardflow-client = { version = "0.1", features = ["aws"] }
//! ```
//!
//! Authentication uses the AWS credential chain: explicit credentials,
//! environment variables, instance profiles, SSO, or named profiles. An
//! `endpoint_url` override points both clients at a local emulator.
//!
//! The state table holds one item per shard under hash key `ShardId`,
//! with `WorkerId`, an ISO-8601 `LastHeartbeat`, and an optional
//! `LastCheckpoint`. Lease writes use condition expressions keyed on
//! `WorkerId`; DynamoDB's `ConditionalCheckFailedException` maps to
//! [`crate::Error::ConditionalCheckFailed`].

use crate::app::App;
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::processor::Processor;
use crate::state_store::StateStore;
use crate::stream::StreamService;
use async_trait::async_trait;
use aws_sdk_dynamodb::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, KeySchemaElement, KeyType, ProvisionedThroughput,
    ScalarAttributeType, TableStatus,
};
use aws_sdk_kinesis::config::{Credentials, Region};
use aws_sdk_kinesis::types::ShardIteratorType;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use shardflow_core::{
    AppName, Batch, ContinuationToken, IteratorPosition, Record, SequenceNumber, ShardId,
    ShardRow, StreamName, TableName, WorkerId,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const HASH_KEY: &str = "ShardId";
const ATTR_WORKER: &str = "WorkerId";
const ATTR_HEARTBEAT: &str = "LastHeartbeat";
const ATTR_CHECKPOINT: &str = "LastCheckpoint";

/// How long to wait for a freshly created table to become active.
const TABLE_WAIT_ATTEMPTS: u32 = 60;
const TABLE_WAIT_DELAY: Duration = Duration::from_secs(1);

/// Explicit AWS credentials. Omit to use the default credential chain.
#[derive(Debug, Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

/// Connection settings for [`App::connect`].
#[derive(Debug, Clone)]
pub struct AwsSettings {
    pub region: String,
    /// Explicit credentials; `None` uses the default chain.
    pub credentials: Option<AwsCredentials>,
    /// Endpoint override for local emulators.
    pub endpoint_url: Option<String>,
}

impl AwsSettings {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            credentials: None,
            endpoint_url: None,
        }
    }

    pub fn credentials(mut self, credentials: AwsCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }
}

impl App {
    /// Start a consumer application against AWS Kinesis and DynamoDB.
    ///
    /// Builds both clients from `settings` and delegates to
    /// [`App::create`].
    pub async fn connect(
        settings: AwsSettings,
        app_name: impl Into<AppName>,
        stream_name: impl Into<StreamName>,
        worker_id: impl Into<WorkerId>,
        processor: Arc<dyn Processor>,
        config: AppConfig,
    ) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()));
        if let Some(credentials) = &settings.credentials {
            loader = loader.credentials_provider(Credentials::new(
                credentials.access_key_id.clone(),
                credentials.secret_access_key.clone(),
                credentials.session_token.clone(),
                None,
                "shardflow",
            ));
        }
        if let Some(endpoint) = &settings.endpoint_url {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let sdk_config = loader.load().await;
        info!(region = %settings.region, "connecting to AWS");

        let stream_service = Arc::new(KinesisStreams::new(aws_sdk_kinesis::Client::new(
            &sdk_config,
        )));
        let state_store = Arc::new(DynamoStateStore::new(aws_sdk_dynamodb::Client::new(
            &sdk_config,
        )));
        App::create(
            stream_service,
            state_store,
            app_name,
            stream_name,
            worker_id,
            processor,
            config,
        )
        .await
    }
}

// ============================================================================
// Kinesis stream service
// ============================================================================

/// [`StreamService`] backed by AWS Kinesis.
pub struct KinesisStreams {
    client: aws_sdk_kinesis::Client,
}

impl KinesisStreams {
    pub fn new(client: aws_sdk_kinesis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StreamService for KinesisStreams {
    async fn list_shards(&self, stream: &StreamName) -> Result<Vec<ShardId>> {
        let mut output = self
            .client
            .list_shards()
            .stream_name(stream.as_str())
            .send()
            .await
            .map_err(|e| Error::transient_stream(e.to_string()))?;

        let mut shards: Vec<ShardId> = output
            .shards()
            .iter()
            .map(|shard| ShardId::from(shard.shard_id()))
            .collect();
        while let Some(token) = output.next_token().map(str::to_string) {
            output = self
                .client
                .list_shards()
                .next_token(token)
                .send()
                .await
                .map_err(|e| Error::transient_stream(e.to_string()))?;
            shards.extend(
                output
                    .shards()
                    .iter()
                    .map(|shard| ShardId::from(shard.shard_id())),
            );
        }
        Ok(shards)
    }

    async fn get_iterator(
        &self,
        stream: &StreamName,
        shard: &ShardId,
        position: &IteratorPosition,
    ) -> Result<ContinuationToken> {
        let request = self
            .client
            .get_shard_iterator()
            .stream_name(stream.as_str())
            .shard_id(shard.as_str());
        let request = match position {
            IteratorPosition::TrimHorizon => {
                request.shard_iterator_type(ShardIteratorType::TrimHorizon)
            }
            IteratorPosition::AtSequenceNumber(seq) => request
                .shard_iterator_type(ShardIteratorType::AtSequenceNumber)
                .starting_sequence_number(seq.as_str()),
            IteratorPosition::AfterSequenceNumber(seq) => request
                .shard_iterator_type(ShardIteratorType::AfterSequenceNumber)
                .starting_sequence_number(seq.as_str()),
            // a continuation token is already an iterator
            IteratorPosition::ContinuationToken(token) => return Ok(token.clone()),
        };

        let output = request
            .send()
            .await
            .map_err(|e| Error::transient_stream(e.to_string()))?;
        output
            .shard_iterator()
            .map(ContinuationToken::from)
            .ok_or_else(|| Error::transient_stream("no shard iterator returned"))
    }

    async fn get_records(&self, token: &ContinuationToken) -> Result<Batch> {
        let output = self
            .client
            .get_records()
            .shard_iterator(token.as_str())
            .send()
            .await
            .map_err(|e| Error::transient_stream(e.to_string()))?;

        let records = output
            .records()
            .iter()
            .map(|record| Record {
                partition_key: record.partition_key().to_string(),
                sequence_number: SequenceNumber::from(record.sequence_number()),
                data: Bytes::from(record.data().clone().into_inner()),
            })
            .collect();
        let next = output.next_shard_iterator().map(ContinuationToken::from);
        debug!(
            behind_ms = output.millis_behind_latest().unwrap_or_default(),
            "fetched kinesis batch"
        );
        Ok(Batch::new(records, next))
    }
}

// ============================================================================
// DynamoDB state store
// ============================================================================

/// [`StateStore`] backed by AWS DynamoDB.
pub struct DynamoStateStore {
    client: aws_sdk_dynamodb::Client,
}

impl DynamoStateStore {
    pub fn new(client: aws_sdk_dynamodb::Client) -> Self {
        Self { client }
    }

    async fn wait_until_active(&self, table: &TableName) -> Result<()> {
        for _ in 0..TABLE_WAIT_ATTEMPTS {
            let output = self
                .client
                .describe_table()
                .table_name(table.as_str())
                .send()
                .await
                .map_err(|e| Error::transient_state_store(e.to_string()))?;
            if output
                .table()
                .and_then(|t| t.table_status())
                .is_some_and(|status| *status == TableStatus::Active)
            {
                return Ok(());
            }
            tokio::time::sleep(TABLE_WAIT_DELAY).await;
        }
        Err(Error::transient_state_store(format!(
            "table {table} did not become active"
        )))
    }
}

#[async_trait]
impl StateStore for DynamoStateStore {
    async fn ensure_table(
        &self,
        table: &TableName,
        read_capacity: u32,
        write_capacity: u32,
    ) -> Result<()> {
        let attribute = AttributeDefinition::builder()
            .attribute_name(HASH_KEY)
            .attribute_type(ScalarAttributeType::S)
            .build()
            .map_err(|e| Error::config(format!("invalid attribute definition: {e}")))?;
        let key_schema = KeySchemaElement::builder()
            .attribute_name(HASH_KEY)
            .key_type(KeyType::Hash)
            .build()
            .map_err(|e| Error::config(format!("invalid key schema: {e}")))?;
        let throughput = ProvisionedThroughput::builder()
            .read_capacity_units(i64::from(read_capacity))
            .write_capacity_units(i64::from(write_capacity))
            .build()
            .map_err(|e| Error::config(format!("invalid provisioned throughput: {e}")))?;

        let created = self
            .client
            .create_table()
            .table_name(table.as_str())
            .attribute_definitions(attribute)
            .key_schema(key_schema)
            .provisioned_throughput(throughput)
            .send()
            .await;
        match created {
            Ok(_) => info!(table = %table, "state table created"),
            Err(err) => {
                let in_use = err
                    .as_service_error()
                    .is_some_and(|e| e.is_resource_in_use_exception());
                if !in_use {
                    return Err(Error::transient_state_store(err.to_string()));
                }
                debug!(table = %table, "state table already exists");
            }
        }
        self.wait_until_active(table).await
    }

    async fn claim_shard(
        &self,
        table: &TableName,
        worker: &WorkerId,
        shard: &ShardId,
        now: DateTime<Utc>,
        heartbeat_timeout: ChronoDuration,
    ) -> Result<()> {
        let stale_before = now - heartbeat_timeout;
        self.client
            .update_item()
            .table_name(table.as_str())
            .key(HASH_KEY, AttributeValue::S(shard.to_string()))
            .condition_expression(format!(
                "attribute_not_exists({HASH_KEY}) OR {ATTR_HEARTBEAT} < :stale"
            ))
            .update_expression(format!(
                "SET {ATTR_WORKER} = :worker, {ATTR_HEARTBEAT} = :now"
            ))
            .expression_attribute_values(":stale", AttributeValue::S(format_time(stale_before)))
            .expression_attribute_values(":worker", AttributeValue::S(worker.to_string()))
            .expression_attribute_values(":now", AttributeValue::S(format_time(now)))
            .send()
            .await
            .map_err(map_dynamo_error)?;
        Ok(())
    }

    async fn read_shard(&self, table: &TableName, shard: &ShardId) -> Result<Option<ShardRow>> {
        let output = self
            .client
            .get_item()
            .table_name(table.as_str())
            .key(HASH_KEY, AttributeValue::S(shard.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| Error::transient_state_store(e.to_string()))?;
        match output.item() {
            None => Ok(None),
            Some(item) => row_from_item(shard, item).map(Some),
        }
    }

    async fn update_heartbeat(
        &self,
        table: &TableName,
        worker: &WorkerId,
        shard: &ShardId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.client
            .update_item()
            .table_name(table.as_str())
            .key(HASH_KEY, AttributeValue::S(shard.to_string()))
            .condition_expression(format!("{ATTR_WORKER} = :worker"))
            .update_expression(format!("SET {ATTR_HEARTBEAT} = :now"))
            .expression_attribute_values(":worker", AttributeValue::S(worker.to_string()))
            .expression_attribute_values(":now", AttributeValue::S(format_time(now)))
            .send()
            .await
            .map_err(map_dynamo_error)?;
        Ok(())
    }

    async fn update_checkpoint(
        &self,
        table: &TableName,
        worker: &WorkerId,
        shard: &ShardId,
        sequence_number: &SequenceNumber,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.client
            .update_item()
            .table_name(table.as_str())
            .key(HASH_KEY, AttributeValue::S(shard.to_string()))
            .condition_expression(format!("{ATTR_WORKER} = :worker"))
            .update_expression(format!(
                "SET {ATTR_CHECKPOINT} = :seq, {ATTR_HEARTBEAT} = :now"
            ))
            .expression_attribute_values(":worker", AttributeValue::S(worker.to_string()))
            .expression_attribute_values(":seq", AttributeValue::S(sequence_number.to_string()))
            .expression_attribute_values(":now", AttributeValue::S(format_time(now)))
            .send()
            .await
            .map_err(map_dynamo_error)?;
        Ok(())
    }
}

/// Fixed-width UTC ISO-8601, so lexicographic order in condition
/// expressions matches chronological order.
fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn map_dynamo_error<E, R>(err: SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata + std::fmt::Debug,
    R: std::fmt::Debug,
{
    if err
        .as_service_error()
        .and_then(|e| e.code())
        .is_some_and(|code| code == "ConditionalCheckFailedException")
    {
        Error::ConditionalCheckFailed
    } else {
        Error::transient_state_store(format!("{err:?}"))
    }
}

fn row_from_item(
    shard: &ShardId,
    item: &std::collections::HashMap<String, AttributeValue>,
) -> Result<ShardRow> {
    let worker = item
        .get(ATTR_WORKER)
        .and_then(|v| v.as_s().ok())
        .ok_or_else(|| Error::transient_state_store(format!("row for {shard} missing WorkerId")))?;
    let heartbeat = item
        .get(ATTR_HEARTBEAT)
        .and_then(|v| v.as_s().ok())
        .ok_or_else(|| {
            Error::transient_state_store(format!("row for {shard} missing LastHeartbeat"))
        })?;
    let heartbeat = DateTime::parse_from_rfc3339(heartbeat)
        .map_err(|e| Error::transient_state_store(format!("bad heartbeat timestamp: {e}")))?
        .with_timezone(&Utc);
    let checkpoint = item
        .get(ATTR_CHECKPOINT)
        .and_then(|v| v.as_s().ok())
        .map(|s| SequenceNumber::from(s.as_str()));

    Ok(ShardRow {
        shard_id: shard.clone(),
        worker_id: WorkerId::from(worker.as_str()),
        last_heartbeat: heartbeat,
        last_checkpoint: checkpoint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn timestamps_sort_lexicographically() {
        let earlier = Utc::now();
        let later = earlier + ChronoDuration::seconds(90);
        assert!(format_time(earlier) < format_time(later));
    }

    #[test]
    fn timestamp_round_trips() {
        let now = Utc::now();
        let parsed = DateTime::parse_from_rfc3339(&format_time(now))
            .unwrap()
            .with_timezone(&Utc);
        assert!((now - parsed).num_milliseconds().abs() < 1);
    }

    #[test]
    fn row_parsing_reads_all_attributes() {
        let shard = ShardId::from("shardId-000000000001");
        let mut item = HashMap::new();
        item.insert(
            ATTR_WORKER.to_string(),
            AttributeValue::S("worker-1".to_string()),
        );
        item.insert(
            ATTR_HEARTBEAT.to_string(),
            AttributeValue::S(format_time(Utc::now())),
        );
        item.insert(
            ATTR_CHECKPOINT.to_string(),
            AttributeValue::S("49590338271490256608559692538361571095921575989136588898".to_string()),
        );

        let row = row_from_item(&shard, &item).unwrap();
        assert_eq!(row.worker_id, WorkerId::from("worker-1"));
        assert!(row.last_checkpoint.is_some());
    }

    #[test]
    fn row_without_checkpoint_parses() {
        let shard = ShardId::from("shardId-000000000001");
        let mut item = HashMap::new();
        item.insert(
            ATTR_WORKER.to_string(),
            AttributeValue::S("worker-1".to_string()),
        );
        item.insert(
            ATTR_HEARTBEAT.to_string(),
            AttributeValue::S(format_time(Utc::now())),
        );
        let row = row_from_item(&shard, &item).unwrap();
        assert!(row.last_checkpoint.is_none());
    }

    #[test]
    fn row_missing_owner_is_an_error() {
        let shard = ShardId::from("shardId-000000000001");
        let item = HashMap::new();
        assert!(row_from_item(&shard, &item).is_err());
    }
}
