//! Messages exchanged between a client and the host.
//!
//! Row and argument payloads are opaque MessagePack blobs; only the schema
//! registry knows how to decode them.

use crate::error::Result;
use crate::types::{ConnectionId, Identity, RequestId, Status, Timestamp};
use serde::{Deserialize, Serialize};

/// One row-level diff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowOp {
    Insert(Vec<u8>),
    Update { old: Vec<u8>, new: Vec<u8> },
    Delete(Vec<u8>),
}

/// Ordered diffs for one table within one transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableUpdate {
    pub table: String,
    pub ops: Vec<RowOp>,
}

/// Full contents of one table at subscription time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub table: String,
    pub rows: Vec<Vec<u8>>,
}

/// A client's request to run a reducer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReducerCall {
    pub reducer: String,
    pub args: Vec<u8>,
    pub request_id: RequestId,
}

/// Outcome of one reducer transaction, with the diffs it committed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionUpdate {
    pub status: Status,
    pub caller_identity: Identity,
    /// None for host-initiated reducers such as `init`.
    pub caller_connection_id: Option<ConnectionId>,
    pub reducer: String,
    pub args: Vec<u8>,
    /// Only set on the copy delivered to the calling connection.
    pub request_id: Option<RequestId>,
    pub timestamp: Timestamp,
    pub tables: Vec<TableUpdate>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Handshake (stream transports only).
    Connect { module: String, token: Option<String> },
    Subscribe { tables: Vec<String> },
    CallReducer(ReducerCall),
    Disconnect,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    IdentityToken {
        identity: Identity,
        token: String,
        connection_id: ConnectionId,
    },
    ConnectRefused { reason: String },
    InitialSubscription { tables: Vec<TableSnapshot> },
    SubscriptionError { reason: String },
    TransactionUpdate(TransactionUpdate),
}

pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(message)?)
}

pub fn decode_message<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_update_survives_codec() {
        let update = ServerMessage::TransactionUpdate(TransactionUpdate {
            status: Status::Failed("no such part".into()),
            caller_identity: Identity::from_token("x"),
            caller_connection_id: Some(ConnectionId(3)),
            reducer: "create_tank".into(),
            args: vec![1, 2, 3],
            request_id: Some(RequestId(9)),
            timestamp: Timestamp(42),
            tables: vec![TableUpdate {
                table: "users".into(),
                ops: vec![RowOp::Update {
                    old: vec![1],
                    new: vec![2],
                }],
            }],
        });

        let bytes = encode_message(&update).unwrap();
        let back: ServerMessage = decode_message(&bytes).unwrap();
        assert_eq!(back, update);
    }

    #[test]
    fn test_garbage_is_a_deserialization_error() {
        let result: Result<ClientMessage> = decode_message(&[0xc1, 0x00]);
        assert!(matches!(
            result,
            Err(crate::error::SyncError::Deserialization(_))
        ));
    }
}
