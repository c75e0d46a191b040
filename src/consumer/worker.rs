//! The replication worker: receive loop and per-message handler.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::broker::{
    BrokerChannel, BrokerConnector, BrokerError, Delivery, Subscription, Topology,
    DEFAULT_EXCHANGE,
};
use crate::envelope::{EnvelopeError, EnvelopeResult, Method, OperationEnvelope, Row};
use crate::mirror::{MirrorStore, Predicate, SoftDeleteColumns};
use crate::outcome::{Alert, AlertDispatcher, Disposition, OutcomeLog, OutcomeRecord};
use crate::registry::PrimaryKeyRegistry;

use super::errors::{ConsumerError, ConsumerResult};
use super::ledger::{message_key, RetryBackoff, RetryDecision, RetryLedger};
use super::row_lock::{RowLocks, RowTurn};
use super::{MessageState, WorkerSettings};

/// Consumes the replication queue and applies each envelope to the mirror
pub struct ReplicationWorker {
    connector: Arc<dyn BrokerConnector>,
    topology: Topology,
    settings: WorkerSettings,
    row_locks: RowLocks,
    core: Arc<WorkerCore>,
}

/// State shared by every in-flight handler
struct WorkerCore {
    dead_letter_queue: String,
    store: Arc<dyn MirrorStore>,
    registry: Arc<PrimaryKeyRegistry>,
    outcome_log: Arc<dyn OutcomeLog>,
    alerts: AlertDispatcher,
    soft_delete: SoftDeleteColumns,
    ledger: RetryLedger,
    backoff: RetryBackoff,
    /// Flips to `true` once shutdown is requested; cuts backoff pauses short
    stopping: watch::Sender<bool>,
}

impl ReplicationWorker {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        topology: Topology,
        store: Arc<dyn MirrorStore>,
        registry: Arc<PrimaryKeyRegistry>,
        outcome_log: Arc<dyn OutcomeLog>,
        alerts: AlertDispatcher,
        settings: WorkerSettings,
    ) -> Self {
        let (stopping, _) = watch::channel(false);
        let core = WorkerCore {
            dead_letter_queue: topology.dead_letter_queue.clone(),
            store,
            registry,
            outcome_log,
            alerts,
            soft_delete: settings.soft_delete.clone(),
            ledger: RetryLedger::new(settings.max_retries),
            backoff: settings.retry_backoff,
            stopping,
        };

        Self {
            connector,
            topology,
            settings,
            row_locks: RowLocks::new(),
            core: Arc::new(core),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Consume until `shutdown` resolves.
    ///
    /// Fails before consuming anything if the broker cannot be reached within
    /// its connect deadline. On shutdown no further deliveries are taken and
    /// handlers already running get `shutdown_grace` to settle; stragglers
    /// are aborted, then the channel is closed and anything still
    /// unacknowledged goes back to the queue.
    pub async fn run<F>(&self, shutdown: F) -> ConsumerResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        let channel: Arc<dyn BrokerChannel> = Arc::from(self.connector.open().await?);
        self.core.stopping.send_replace(false);

        let started = self.start(channel.as_ref()).await;
        let mut subscription = match started {
            Ok(subscription) => subscription,
            Err(e) => {
                let _ = channel.close().await;
                return Err(e);
            }
        };

        info!(
            queue = %self.topology.queue,
            exchange = %self.topology.exchange,
            prefetch = self.settings.prefetch,
            max_retries = self.settings.max_retries,
            "replication worker consuming"
        );

        let mut handlers = JoinSet::new();
        tokio::pin!(shutdown);

        let outcome = loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!(in_flight = handlers.len(), "shutdown requested; no longer taking deliveries");
                    break Ok(());
                }

                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    report_join(joined);
                }

                next = subscription.next_delivery() => match next {
                    Some(Ok(delivery)) => self.dispatch(&mut handlers, &channel, delivery),
                    Some(Err(e)) => {
                        error!(error = %e, "delivery stream failed");
                        break Err(ConsumerError::from(e));
                    }
                    None => {
                        warn!("delivery stream ended");
                        break Err(ConsumerError::from(BrokerError::ChannelClosed));
                    }
                },
            }
        };

        drop(subscription);
        self.core.stopping.send_replace(true);
        self.drain(&mut handlers).await;

        if let Err(e) = channel.close().await {
            warn!(error = %e, "channel close failed");
        }
        info!("replication worker stopped");
        outcome
    }

    /// Let running handlers settle, aborting whatever outlives the grace period
    async fn drain(&self, handlers: &mut JoinSet<Disposition>) {
        let grace = self.settings.shutdown_grace;
        let settled = tokio::time::timeout(grace, async {
            while let Some(joined) = handlers.join_next().await {
                report_join(joined);
            }
        })
        .await;

        if settled.is_err() {
            warn!(
                in_flight = handlers.len(),
                grace_ms = grace.as_millis() as u64,
                "handlers still running after shutdown grace; aborting"
            );
            handlers.abort_all();
            while let Some(joined) = handlers.join_next().await {
                report_join(joined);
            }
        }
    }

    async fn start(&self, channel: &dyn BrokerChannel) -> ConsumerResult<Box<dyn Subscription>> {
        channel.assert_topology(&self.topology).await?;
        channel.set_prefetch(self.settings.prefetch).await?;
        let subscription = channel
            .consume(&self.topology.queue, &self.settings.consumer_tag)
            .await?;
        Ok(subscription)
    }

    /// Decode, reserve the row turn in delivery order, then hand off
    fn dispatch(
        &self,
        handlers: &mut JoinSet<Disposition>,
        channel: &Arc<dyn BrokerChannel>,
        delivery: Delivery,
    ) {
        debug!(
            bytes = delivery.body().len(),
            redelivered = delivery.redelivered(),
            state = %MessageState::Received,
            "delivery received"
        );

        let parsed = OperationEnvelope::decode(delivery.body());
        let turn = parsed.as_ref().ok().and_then(|envelope| {
            row_key(envelope).map(|row| self.row_locks.reserve(&envelope.table, &row))
        });

        let core = Arc::clone(&self.core);
        let channel = Arc::clone(channel);
        handlers.spawn(async move { core.handle(channel.as_ref(), delivery, parsed, turn).await });
    }
}

impl WorkerCore {
    async fn handle(
        &self,
        channel: &dyn BrokerChannel,
        delivery: Delivery,
        parsed: EnvelopeResult<OperationEnvelope>,
        turn: Option<RowTurn>,
    ) -> Disposition {
        debug!(state = %MessageState::Validating, "validating envelope");
        let key = message_key(delivery.body());
        let envelope = match parsed {
            Ok(envelope) => envelope,
            Err(e) => return self.reject(&delivery, &key, None, e.into()).await,
        };

        // Held until the message is settled
        let _row = match turn {
            Some(turn) => Some(turn.acquire().await),
            None => None,
        };

        debug!(
            operation_id = %envelope.operation_id,
            table = %envelope.table,
            method = %envelope.method,
            redelivered = delivery.redelivered(),
            query_sql = envelope.has_query_sql(),
            state = %MessageState::Executing,
            "applying mutation"
        );

        match self.execute(&envelope).await {
            Ok(rows) => self.accept(&delivery, &key, &envelope, rows).await,
            Err(e) if !e.is_retryable() => self.reject(&delivery, &key, Some(&envelope), e).await,
            Err(e) => self.retry(channel, &delivery, &key, &envelope, e).await,
        }
    }

    async fn execute(&self, envelope: &OperationEnvelope) -> ConsumerResult<Vec<Row>> {
        let table = envelope.table.as_str();
        let empty = Row::new();

        let rows = match envelope.method {
            Method::Create => {
                let mut data = envelope.data.clone().unwrap_or_default();
                if let Some(value) = &envelope.primary_key_value {
                    self.registry.synchronize(table, &mut data, value);
                }
                match &envelope.query_sql {
                    Some(sql) => self.store.execute(sql).await?,
                    None => self.store.insert(table, &data).await?,
                }
            }
            Method::Update => {
                let predicate = row_predicate(envelope)?;
                match &envelope.query_sql {
                    Some(sql) => self.store.execute(sql).await?,
                    None => {
                        let data = envelope.data.as_ref().unwrap_or(&empty);
                        self.store.update(table, data, &predicate).await?
                    }
                }
            }
            Method::Delete => {
                let predicate = row_predicate(envelope)?;
                match &envelope.query_sql {
                    Some(sql) => self.store.execute(sql).await?,
                    None => {
                        let patch = self.soft_delete.patch(envelope.data.as_ref(), Utc::now());
                        self.store.update(table, &patch, &predicate).await?
                    }
                }
            }
        };

        Ok(rows)
    }

    async fn accept(
        &self,
        delivery: &Delivery,
        key: &str,
        envelope: &OperationEnvelope,
        rows: Vec<Row>,
    ) -> Disposition {
        self.ledger.clear(key);
        if let Err(e) = delivery.ack().await {
            error!(operation_id = %envelope.operation_id, error = %e, "ack failed; broker will redeliver");
        }

        info!(
            operation_id = %envelope.operation_id,
            table = %envelope.table,
            method = %envelope.method,
            rows = rows.len(),
            outcome = %Disposition::Acked,
            "mutation replicated"
        );

        let result = Value::Array(rows.into_iter().map(Value::Object).collect());
        self.record(OutcomeRecord::for_envelope(envelope, Disposition::Acked).with_result(result))
            .await;
        Disposition::Acked
    }

    async fn reject(
        &self,
        delivery: &Delivery,
        key: &str,
        envelope: Option<&OperationEnvelope>,
        error: ConsumerError,
    ) -> Disposition {
        let disposition = Disposition::NackedNoRequeue;
        self.ledger.clear(key);
        if let Err(e) = delivery.nack(false).await {
            error!(error = %e, "nack failed");
        }

        let record = match envelope {
            Some(envelope) => {
                warn!(
                    operation_id = %envelope.operation_id,
                    table = %envelope.table,
                    method = %envelope.method,
                    error = %error,
                    outcome = %disposition,
                    "mutation rejected"
                );
                OutcomeRecord::for_envelope(envelope, disposition)
            }
            None => {
                warn!(error = %error, outcome = %disposition, "payload rejected");
                OutcomeRecord::bare(disposition)
            }
        };

        self.record(record.with_error(error.to_string())).await;
        disposition
    }

    async fn retry(
        &self,
        channel: &dyn BrokerChannel,
        delivery: &Delivery,
        key: &str,
        envelope: &OperationEnvelope,
        error: ConsumerError,
    ) -> Disposition {
        let decision = self.ledger.record_failure(key);
        let attempt = decision.attempt();

        let (disposition, error_text) = match decision {
            RetryDecision::Requeue { attempt } => {
                self.alert(envelope, &error);
                self.pause(attempt).await;
                if let Err(e) = delivery.nack(true).await {
                    error!(operation_id = %envelope.operation_id, error = %e, "nack failed");
                }
                (Disposition::NackedRequeue, error.to_string())
            }
            RetryDecision::DeadLetter { .. } => match self.dead_letter(channel, delivery).await {
                Ok(()) => {
                    self.ledger.clear(key);
                    self.alert(envelope, &error);
                    (Disposition::DeadLettered, error.to_string())
                }
                Err(dlq_error) => {
                    error!(
                        operation_id = %envelope.operation_id,
                        error = %dlq_error,
                        "dead-lettering failed; requeueing"
                    );
                    if let Err(e) = delivery.nack(true).await {
                        error!(operation_id = %envelope.operation_id, error = %e, "nack failed");
                    }
                    (
                        Disposition::NackedRequeue,
                        format!("{}; dead-lettering failed: {}", error, dlq_error),
                    )
                }
            },
        };

        warn!(
            operation_id = %envelope.operation_id,
            table = %envelope.table,
            method = %envelope.method,
            attempt,
            max_retries = self.ledger.max_retries(),
            error = %error_text,
            outcome = %disposition,
            "mutation failed"
        );

        self.record(
            OutcomeRecord::for_envelope(envelope, disposition)
                .with_error(error_text)
                .with_attempt(attempt),
        )
        .await;
        disposition
    }

    /// Hold a failed message before it is requeued; shutdown ends the wait
    async fn pause(&self, attempt: u32) {
        let delay = self.backoff.delay(attempt);
        if delay.is_zero() {
            return;
        }

        let mut stopping = self.stopping.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = async {
                let _ = stopping.wait_for(|stopped| *stopped).await;
            } => {}
        }
    }

    /// Copy the body to the dead-letter queue, then drop the original
    async fn dead_letter(
        &self,
        channel: &dyn BrokerChannel,
        delivery: &Delivery,
    ) -> Result<(), BrokerError> {
        channel
            .publish(DEFAULT_EXCHANGE, &self.dead_letter_queue, delivery.body())
            .await?;
        delivery.ack().await
    }

    fn alert(&self, envelope: &OperationEnvelope, error: &ConsumerError) {
        let mut alert = Alert::new(
            format!(
                "{} on {}.{} failed",
                envelope.method, envelope.database, envelope.table
            ),
            error.to_string(),
        )
        .with_operation_id(envelope.operation_id.clone());
        if let Ok(value) = serde_json::to_value(envelope) {
            alert = alert.with_envelope(value);
        }
        self.alerts.notify(alert);
    }

    /// Append off the async workers; the file write ends with an fsync
    async fn record(&self, record: OutcomeRecord) {
        let log = Arc::clone(&self.outcome_log);
        let written = tokio::task::spawn_blocking(move || {
            let result = log.append(&record);
            (record, result)
        })
        .await;

        match written {
            Ok((_, Ok(()))) => {}
            Ok((record, Err(e))) => error!(
                operation_id = ?record.operation_id,
                outcome = %record.disposition,
                error = %e,
                "outcome log write failed"
            ),
            Err(e) => error!(error = %e, "outcome log writer task failed"),
        }
    }
}

/// Row a mutation touches, when it can be known before execution
fn row_key(envelope: &OperationEnvelope) -> Option<String> {
    match envelope.method {
        Method::Create => envelope.primary_key_value.as_ref().map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }),
        Method::Update | Method::Delete => envelope.record_id.clone(),
    }
}

fn row_predicate(envelope: &OperationEnvelope) -> ConsumerResult<Predicate> {
    match (&envelope.primary_key, &envelope.record_id) {
        (Some(column), Some(id)) => Ok(Predicate::eq(column.as_str(), id.as_str())),
        _ => Err(EnvelopeError::MissingRowIdentity(envelope.method.to_string()).into()),
    }
}

fn report_join(joined: Result<Disposition, JoinError>) {
    match joined {
        Ok(disposition) => debug!(state = %MessageState::Settled(disposition), "handler finished"),
        Err(e) if e.is_cancelled() => {
            warn!("message handler aborted; its delivery returns to the queue")
        }
        Err(e) => error!(error = %e, "message handler panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::mirror::MemoryMirror;
    use crate::outcome::MemoryOutcomeLog;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn topology() -> Topology {
        Topology::new("gate.mutations", "gate.mirror")
    }

    fn envelope(body: Value) -> OperationEnvelope {
        OperationEnvelope::decode(body.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn test_row_key_per_method() {
        let create = envelope(json!({
            "database": "gate", "table": "companies", "method": "create",
            "data": {"company_name": "Acme"}, "primary_key_value": 7
        }));
        let update = envelope(json!({
            "database": "gate", "table": "departments", "method": "update",
            "data": {"name": "Ops"}, "record_id": "42", "primary_key": "department_id"
        }));
        let anonymous = envelope(json!({
            "database": "gate", "table": "notes", "method": "create", "data": {"title": "x"}
        }));

        assert_eq!(row_key(&create).as_deref(), Some("7"));
        assert_eq!(row_key(&update).as_deref(), Some("42"));
        assert_eq!(row_key(&anonymous), None);
    }

    #[tokio::test]
    async fn test_run_fails_fast_when_broker_unreachable() {
        let broker = MemoryBroker::new();
        broker.set_available(false);

        let worker = ReplicationWorker::new(
            Arc::new(broker),
            topology(),
            Arc::new(MemoryMirror::new()),
            Arc::new(PrimaryKeyRegistry::gate_defaults()),
            Arc::new(MemoryOutcomeLog::new()),
            AlertDispatcher::disabled(),
            WorkerSettings::default(),
        );

        let err = worker.run(std::future::pending()).await.unwrap_err();
        assert!(matches!(err, ConsumerError::Broker(BrokerError::Connection(_))));
    }

    #[tokio::test]
    async fn test_shutdown_with_empty_queue_closes_cleanly() {
        let broker = MemoryBroker::new();
        let log = MemoryOutcomeLog::new();
        let worker = ReplicationWorker::new(
            Arc::new(broker.clone()),
            topology(),
            Arc::new(MemoryMirror::new()),
            Arc::new(PrimaryKeyRegistry::gate_defaults()),
            Arc::new(log.clone()),
            AlertDispatcher::disabled(),
            WorkerSettings::default(),
        );

        let (stop, stopped) = oneshot::channel::<()>();
        let run = tokio::spawn(async move {
            worker
                .run(async {
                    let _ = stopped.await;
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(broker.queue_exists("gate.mirror"));
        assert!(log.is_empty());
    }
}
