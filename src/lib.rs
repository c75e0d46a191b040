//! gate-replicator - asynchronous replication of administrative mutations
//!
//! A publisher turns each local mutation into an operation envelope on a
//! fanout exchange; a replication worker consumes the bound queue and
//! applies every envelope to a mirror database, keeping primary keys in
//! step with the source system.
//!
//! Leaves first:
//! - `broker`: exchange/queue topology, AMQP and in-memory clients
//! - `envelope`: the wire payload and its validation
//! - `publisher`: one message per mutation
//! - `registry`: table -> primary-key column lookup
//! - `mirror`: the mirror database executor
//! - `outcome`: durable outcome log and operator alerts
//! - `consumer`: the replication worker
//! - `config`, `cli`: process wiring

pub mod broker;
pub mod cli;
pub mod config;
pub mod consumer;
pub mod envelope;
pub mod mirror;
pub mod outcome;
pub mod publisher;
pub mod registry;
