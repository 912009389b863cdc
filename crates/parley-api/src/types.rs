use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QualifiedId {
    pub id: String,
    pub domain: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientId {
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConversationId {
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageId {
    pub value: Uuid,
}

/// One ciphertext addressed to a single client, payload base64-encoded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OtrClientEntry {
    pub client: ClientId,
    pub payload: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OtrUserEntry {
    pub user: QualifiedId,
    pub clients: Vec<OtrClientEntry>,
}

/// Body of `POST /conversations/{cid}/otr/messages`. Built fresh per send
/// attempt and immutable once submitted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewOtrMessage {
    pub sender: ClientId,
    pub recipients: Vec<OtrUserEntry>,
    pub native_push: bool,
    pub transient: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserClients {
    pub user: QualifiedId,
    pub clients: Vec<ClientId>,
}

/// Stale-recipients response for a rejected send. Each list maps users to
/// the clients the server believes the sender got wrong.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientMismatch {
    pub missing: Vec<UserClients>,
    pub redundant: Vec<UserClients>,
    pub deleted: Vec<UserClients>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreKeyDto {
    pub id: u16,
    pub key: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignedPreKeyDto {
    pub id: u32,
    pub key: String,
    pub signature: String,
}

/// Everything a peer needs to bootstrap a session with one client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreKeyBundleDto {
    pub identity_key: String,
    pub signing_key: String,
    pub signed_prekey: SignedPreKeyDto,
    pub prekey: PreKeyDto,
    pub last_resort: bool,
}

/// A `prekey` of `None` means the client exists but has no prekey to hand
/// out. Distinct from a transport failure, which fails the whole request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientPreKeyEntry {
    pub client: ClientId,
    pub prekey: Option<PreKeyBundleDto>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserPreKeyEntry {
    pub user: QualifiedId,
    pub clients: Vec<ClientPreKeyEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreKeyMapResponse {
    pub users: Vec<UserPreKeyEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewClientRequest {
    pub identity_key: String,
    pub signing_key: String,
    pub signed_prekey: SignedPreKeyDto,
    pub prekeys: Vec<PreKeyDto>,
    pub last_resort_prekey: PreKeyDto,
    pub label: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum EventKind {
    MessageAdd,
    MemberJoin,
    MemberLeave,
    ClientRemove,
}

/// One server event, ordered by `id` within a device's stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventDto {
    pub id: u64,
    pub kind: EventKind,
    pub conversation: ConversationId,
    pub from_user: QualifiedId,
    pub from_client: ClientId,
    pub payload: Option<String>,
    pub time: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationLimits {
    pub max_payload_bytes: usize,
    pub max_clients_per_user: usize,
    pub min_prekeys: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_payload_bytes: 256 * 1024,
            max_clients_per_user: 16,
            min_prekeys: 8,
        }
    }
}

impl QualifiedId {
    pub fn new(id: impl Into<String>, domain: Option<String>) -> Self {
        Self {
            id: id.into(),
            domain,
        }
    }
}

impl ClientId {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl ConversationId {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl MessageId {
    pub fn random() -> Self {
        Self {
            value: Uuid::new_v4(),
        }
    }
}

impl NewOtrMessage {
    pub fn client_count(&self) -> usize {
        self.recipients.iter().map(|u| u.clients.len()).sum()
    }
}
