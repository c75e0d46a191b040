//! # Operation Envelope Codec
//!
//! Builds and validates the message payload shared by the publisher and
//! the replication worker.
//!
//! ## Invariants
//! - Method is exactly one of create, update, delete
//! - Create carries data; update and delete carry record_id and primary_key
//! - Wire form is UTF-8 JSON with a lowercase method

mod codec;
mod errors;
mod id;
mod method;

pub use codec::{MutationRequest, OperationEnvelope, Row};
pub use errors::{EnvelopeError, EnvelopeResult};
pub use id::new_operation_id;
pub use method::Method;
