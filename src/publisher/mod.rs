//! # Publisher
//!
//! Turns a local mutation into a durable broker message.
//!
//! Every publish opens its own connection, asserts the topology, publishes
//! once and closes again. Nothing is pooled, so a failing broker can never
//! leak connections into the caller's process.
//!
//! `publish` is an async operation with no internal retry. Callers that must
//! not block on replication wrap it in their own timeout.

mod errors;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::broker::{BrokerConnector, Topology, FANOUT_ROUTING_KEY};
use crate::envelope::{Method, MutationRequest, OperationEnvelope, Row};

pub use errors::{PublishError, PublishResult};

/// Publish status reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishStatus {
    Published,
}

/// Acknowledgement that a message was handed to the broker
///
/// Says nothing about whether the mirror applied it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub operation_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: PublishStatus,
}

/// Publishes mutation envelopes to the fanout exchange
#[derive(Clone)]
pub struct Publisher {
    connector: Arc<dyn BrokerConnector>,
    topology: Topology,
}

impl Publisher {
    pub fn new(connector: Arc<dyn BrokerConnector>, topology: Topology) -> Self {
        Self {
            connector,
            topology,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Validate, envelope and publish one mutation.
    ///
    /// Preconditions are checked before the broker is contacted.
    pub async fn publish(&self, request: MutationRequest) -> PublishResult<PublishReceipt> {
        let envelope = OperationEnvelope::from_request(request)?;
        self.publish_envelope(&envelope).await
    }

    /// Publish an envelope that was built elsewhere (e.g. read from a file)
    pub async fn publish_envelope(
        &self,
        envelope: &OperationEnvelope,
    ) -> PublishResult<PublishReceipt> {
        envelope.validate()?;
        let body = envelope.encode()?;

        let channel = self.connector.open().await?;
        let published = async {
            channel.assert_topology(&self.topology).await?;
            channel
                .publish(&self.topology.exchange, FANOUT_ROUTING_KEY, &body)
                .await
        }
        .await;

        if let Err(e) = channel.close().await {
            warn!(operation_id = %envelope.operation_id, error = %e, "publisher channel close failed");
        }
        published?;

        info!(
            operation_id = %envelope.operation_id,
            database = %envelope.database,
            table = %envelope.table,
            method = %envelope.method,
            exchange = %self.topology.exchange,
            "mutation published"
        );

        Ok(PublishReceipt {
            operation_id: envelope.operation_id.clone(),
            timestamp: envelope.timestamp,
            status: PublishStatus::Published,
        })
    }

    /// Publish a row creation, optionally pinning the mirror identity
    pub async fn publish_create(
        &self,
        database: &str,
        table: &str,
        data: Row,
        primary_key_value: Option<Value>,
    ) -> PublishResult<PublishReceipt> {
        let mut request = MutationRequest::new(database, table, Method::Create.as_str()).with_data(data);
        request.primary_key_value = primary_key_value;
        self.publish(request).await
    }

    /// Publish an update of the row `primary_key = record_id`
    pub async fn publish_update(
        &self,
        database: &str,
        table: &str,
        primary_key: &str,
        record_id: &str,
        data: Row,
    ) -> PublishResult<PublishReceipt> {
        let request = MutationRequest::new(database, table, Method::Update.as_str())
            .with_record(primary_key, record_id)
            .with_data(data);
        self.publish(request).await
    }

    /// Publish a soft delete; `data` carries auxiliary columns such as the actor
    pub async fn publish_delete(
        &self,
        database: &str,
        table: &str,
        primary_key: &str,
        record_id: &str,
        data: Option<Row>,
    ) -> PublishResult<PublishReceipt> {
        let mut request = MutationRequest::new(database, table, Method::Delete.as_str())
            .with_record(primary_key, record_id);
        request.data = data;
        self.publish(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, MemoryBroker};
    use crate::envelope::EnvelopeError;
    use serde_json::json;

    fn publisher(broker: &MemoryBroker) -> Publisher {
        Publisher::new(
            Arc::new(broker.clone()),
            Topology::new("gate.mutations", "gate.mirror"),
        )
    }

    fn name(value: &str) -> Row {
        let mut row = Row::new();
        row.insert("company_name".into(), json!(value));
        row
    }

    #[tokio::test]
    async fn test_publish_create_lands_on_queue() {
        let broker = MemoryBroker::new();
        let receipt = publisher(&broker)
            .publish_create("gate_db", "companies", name("Acme"), Some(json!("1111")))
            .await
            .unwrap();

        assert_eq!(receipt.status, PublishStatus::Published);
        assert!(receipt.operation_id.starts_with("op_"));

        let bodies = broker.ready_messages("gate.mirror");
        assert_eq!(bodies.len(), 1);
        let envelope = OperationEnvelope::decode(&bodies[0]).unwrap();
        assert_eq!(envelope.operation_id, receipt.operation_id);
        assert_eq!(envelope.primary_key_value, Some(json!("1111")));
    }

    #[tokio::test]
    async fn test_precondition_failure_never_touches_broker() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);

        let mut request = MutationRequest::new("gate_db", "companies", "update").with_data(name("x"));
        request.primary_key = Some("company_id".into());
        let err = publisher.publish(request).await.unwrap_err();

        assert!(err.is_precondition());
        assert_eq!(broker.published_count(), 0);
        assert!(!broker.queue_exists("gate.mirror"));

        let err = publisher
            .publish(MutationRequest::new("gate_db", "companies", "merge"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PublishError::Precondition(EnvelopeError::UnsupportedMethod(_))
        ));
    }

    #[tokio::test]
    async fn test_broker_outage_surfaces_to_caller() {
        let broker = MemoryBroker::new();
        broker.set_available(false);

        let err = publisher(&broker)
            .publish_delete("gate_db", "companies", "company_id", "1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Broker(BrokerError::Connection(_))));
    }

    #[tokio::test]
    async fn test_each_publish_gets_a_fresh_operation_id() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);

        let a = publisher
            .publish_update("gate_db", "companies", "company_id", "1", name("A"))
            .await
            .unwrap();
        let b = publisher
            .publish_update("gate_db", "companies", "company_id", "1", name("A"))
            .await
            .unwrap();

        assert_ne!(a.operation_id, b.operation_id);
        assert_eq!(broker.queue_depth("gate.mirror"), 2);
    }
}
