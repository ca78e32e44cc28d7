//! Versioned wire contracts for cluster messages
//!
//! Every request type is bound to exactly one [`MessageSubject`] and one
//! response type through [`ClusterRequest`], so a handler and its caller
//! cannot disagree on payload shapes. Messages travel in an envelope that
//! carries the subject and its wire version; decoding rejects a mismatch on
//! either before the body is touched.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use flowstore_common::{DeviceId, FlowStoreError, Result};

use crate::model::{CompletedBatchOperation, FlowEntry, FlowRule, FlowRuleBatch};

/// Subjects exchanged between flowstore nodes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageSubject {
    /// Forward a batch to the device master
    ApplyBatch,
    /// Forward a single-rule lookup
    GetEntry,
    /// Forward a full device table lookup
    GetDeviceEntries,
    /// Push a device table copy to a backup node
    UpdateBackup,
}

impl MessageSubject {
    pub const ALL: [MessageSubject; 4] = [
        MessageSubject::ApplyBatch,
        MessageSubject::GetEntry,
        MessageSubject::GetDeviceEntries,
        MessageSubject::UpdateBackup,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            MessageSubject::ApplyBatch => "APPLY_BATCH",
            MessageSubject::GetEntry => "GET_ENTRY",
            MessageSubject::GetDeviceEntries => "GET_DEVICE_ENTRIES",
            MessageSubject::UpdateBackup => "UPDATE_BACKUP",
        }
    }

    /// Current wire version of the subject's request and response bodies
    pub const fn wire_version(&self) -> u16 {
        match self {
            MessageSubject::ApplyBatch
            | MessageSubject::GetEntry
            | MessageSubject::GetDeviceEntries
            | MessageSubject::UpdateBackup => 1,
        }
    }
}

impl std::fmt::Display for MessageSubject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request bound to its subject and response type
pub trait ClusterRequest: Serialize + DeserializeOwned + Send + Sync + 'static {
    const SUBJECT: MessageSubject;

    type Response: Serialize + DeserializeOwned + Send + 'static;

    fn encode(&self) -> Result<Vec<u8>> {
        encode_body(Self::SUBJECT, self)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        decode_body(Self::SUBJECT, bytes)
    }

    fn encode_response(response: &Self::Response) -> Result<Vec<u8>> {
        encode_body(Self::SUBJECT, response)
    }

    fn decode_response(bytes: &[u8]) -> Result<Self::Response> {
        decode_body(Self::SUBJECT, bytes)
    }
}

#[derive(Serialize)]
struct Envelope<'a, T> {
    subject: MessageSubject,
    version: u16,
    body: &'a T,
}

#[derive(Deserialize)]
struct EnvelopeHeader {
    subject: MessageSubject,
    version: u16,
}

#[derive(Deserialize)]
struct EnvelopeBody<T> {
    body: T,
}

fn encode_body<T: Serialize>(subject: MessageSubject, body: &T) -> Result<Vec<u8>> {
    let envelope = Envelope {
        subject,
        version: subject.wire_version(),
        body,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

fn decode_body<T: DeserializeOwned>(subject: MessageSubject, bytes: &[u8]) -> Result<T> {
    let header: EnvelopeHeader = serde_json::from_slice(bytes)?;
    if header.subject != subject {
        return Err(FlowStoreError::Codec(format!(
            "expected subject {} but received {}",
            subject, header.subject
        )));
    }
    if header.version != subject.wire_version() {
        return Err(FlowStoreError::Codec(format!(
            "unsupported {} wire version {} (expected {})",
            subject,
            header.version,
            subject.wire_version()
        )));
    }
    let envelope: EnvelopeBody<T> = serde_json::from_slice(bytes)?;
    Ok(envelope.body)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyBatchRequest {
    pub batch: FlowRuleBatch,
}

impl ClusterRequest for ApplyBatchRequest {
    const SUBJECT: MessageSubject = MessageSubject::ApplyBatch;
    type Response = CompletedBatchOperation;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetEntryRequest {
    pub rule: FlowRule,
}

impl ClusterRequest for GetEntryRequest {
    const SUBJECT: MessageSubject = MessageSubject::GetEntry;
    type Response = Option<FlowEntry>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDeviceEntriesRequest {
    pub device_id: DeviceId,
}

impl ClusterRequest for GetDeviceEntriesRequest {
    const SUBJECT: MessageSubject = MessageSubject::GetDeviceEntries;
    type Response = Vec<FlowEntry>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBackupRequest {
    pub device_id: DeviceId,
    pub entries: Vec<FlowEntry>,
}

/// Acknowledgement of a backup copy
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupAck {
    pub accepted: bool,
}

impl ClusterRequest for UpdateBackupRequest {
    const SUBJECT: MessageSubject = MessageSubject::UpdateBackup;
    type Response = BackupAck;
}
