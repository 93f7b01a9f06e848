/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait for the pluggable payload body store.
//!
//! Block trees keep only payload ids. The bodies live in a key-value store provided by the library
//! user, who implements [`PayloadStore::get`] and [`PayloadStore::put`]; the typed accessors are
//! provided on top of them.
//!
//! Keys have the shape `PAYLOADS ++ [kind tag] ++ id`.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    data_types::PayloadId,
    header::Header,
    payloads::{Payload, PayloadKind},
};

pub const PAYLOADS: [u8; 1] = [0];

pub trait PayloadStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    fn put(&mut self, key: Vec<u8>, value: Vec<u8>);

    /// Get the body of payload `id` of kind `kind`.
    fn payload<G: Header>(
        &self,
        kind: PayloadKind,
        id: &PayloadId,
    ) -> Result<Payload<G>, PayloadStoreError> {
        let bytes = self
            .get(&payload_key(kind, id))
            .ok_or(PayloadStoreError::NotFound { kind, id: *id })?;
        let payload = Payload::<G>::deserialize(&mut bytes.as_slice()).map_err(|err| {
            PayloadStoreError::DeserializeValueError {
                kind,
                id: *id,
                reason: err.to_string(),
            }
        })?;
        if payload.kind() != kind {
            return Err(PayloadStoreError::KindMismatch {
                expected: kind,
                id: *id,
            });
        }
        Ok(payload)
    }

    /// Store `payload` under its id, and return the id.
    fn put_payload<G: Header>(&mut self, payload: &Payload<G>) -> Result<PayloadId, PayloadStoreError> {
        let kind = payload.kind();
        let id = payload.id();
        let bytes = payload
            .try_to_vec()
            .map_err(|err| PayloadStoreError::SerializeValueError {
                kind,
                id,
                reason: err.to_string(),
            })?;
        self.put(payload_key(kind, &id), bytes);
        Ok(id)
    }
}

pub fn payload_key(kind: PayloadKind, id: &PayloadId) -> Vec<u8> {
    let mut key = Vec::with_capacity(PAYLOADS.len() + 1 + 32);
    key.extend_from_slice(&PAYLOADS);
    key.push(kind.tag());
    key.extend_from_slice(&id.bytes());
    key
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadStoreError {
    #[error("{} payload {id} not found in the payload store", .kind.name())]
    NotFound { kind: PayloadKind, id: PayloadId },

    #[error("{} payload {id} could not be deserialized: {reason}", .kind.name())]
    DeserializeValueError {
        kind: PayloadKind,
        id: PayloadId,
        reason: String,
    },

    #[error("{} payload {id} could not be serialized: {reason}", .kind.name())]
    SerializeValueError {
        kind: PayloadKind,
        id: PayloadId,
        reason: String,
    },

    #[error("payload {id} is not a {} payload", .expected.name())]
    KindMismatch { expected: PayloadKind, id: PayloadId },
}

impl PayloadStoreError {
    pub fn code(&self) -> &'static str {
        match self {
            PayloadStoreError::NotFound { .. } => "payload-not-found",
            PayloadStoreError::DeserializeValueError { .. } => "payload-deserialize",
            PayloadStoreError::SerializeValueError { .. } => "payload-serialize",
            PayloadStoreError::KindMismatch { .. } => "payload-kind-mismatch",
        }
    }
}
