//! Wire and storage types: content hashes, messages, proofs and the envelope
//! that carries them between nodes.

use std::fmt;
use std::str::FromStr;

use log::debug;
use pasta_curves::pallas;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::NodeError;
use crate::ethereum::normalize_address;
use crate::utils::{bytes_to_field, field_from_repr, sha3_concat, strip_hex_prefix};

pub const HASH_SIZE: usize = 32;

/// Current envelope format version. Payloads with any other version are
/// treated as malformed.
pub const ENVELOPE_VERSION: u16 = 1;

/// Version byte mixed into the canonical message serialization.
const CANONICAL_VERSION: u8 = 1;

/// A 32-byte digest: content addresses, merkle roots, nullifiers and identity
/// commitments all share this representation.
///
/// Serialized as lowercase hex; parsing accepts an optional `0x` prefix.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash32(pub [u8; HASH_SIZE]);

impl Hash32 {
    #[must_use]
    pub const fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Field element view used for public signals.
    #[must_use]
    pub fn to_field(&self) -> pallas::Base {
        bytes_to_field(&self.0)
    }
}

impl From<[u8; HASH_SIZE]> for Hash32 {
    fn from(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }
}

impl FromStr for Hash32 {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = strip_hex_prefix(s);
        let bytes = hex::decode(stripped)
            .map_err(|e| NodeError::MalformedMessage(format!("invalid hash hex '{s}': {e}")))?;
        let len = bytes.len();
        let array: [u8; HASH_SIZE] = bytes.try_into().map_err(|_| {
            NodeError::MalformedMessage(format!("hash must be {HASH_SIZE} bytes, got {len}"))
        })?;
        Ok(Self(array))
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl Serialize for Hash32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Identifier of a membership group, e.g. `zksocial_all` or
/// `interrep_twitter_gold`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostKind {
    Default,
    Repost,
    MirrorPost,
    MirrorReply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModerationKind {
    Like,
    Block,
    Global,
    ThreadHideBlock,
    ThreadShowFollow,
    ThreadOnlyMention,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionKind {
    Follow,
    Block,
    MemberInvite,
    MemberAccept,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProfileKind {
    Name,
    Bio,
    ProfileImage,
    CoverImage,
    Website,
    Group,
    Custom,
}

/// Top-level message type; each one is stored in its own partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Post,
    Moderation,
    Connection,
    Profile,
}

impl MessageType {
    pub const ALL: [MessageType; 4] = [
        MessageType::Post,
        MessageType::Moderation,
        MessageType::Connection,
        MessageType::Profile,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Post => "post",
            MessageType::Moderation => "moderation",
            MessageType::Connection => "connection",
            MessageType::Profile => "profile",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message type together with its subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "subtype", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Post(PostKind),
    Moderation(ModerationKind),
    Connection(ConnectionKind),
    Profile(ProfileKind),
}

impl MessageKind {
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageKind::Post(_) => MessageType::Post,
            MessageKind::Moderation(_) => MessageType::Moderation,
            MessageKind::Connection(_) => MessageType::Connection,
            MessageKind::Profile(_) => MessageType::Profile,
        }
    }

    fn subtype_tag(&self) -> &'static str {
        match self {
            MessageKind::Post(kind) => match kind {
                PostKind::Default => "",
                PostKind::Repost => "REPOST",
                PostKind::MirrorPost => "M_POST",
                PostKind::MirrorReply => "M_REPLY",
            },
            MessageKind::Moderation(kind) => match kind {
                ModerationKind::Like => "LIKE",
                ModerationKind::Block => "BLOCK",
                ModerationKind::Global => "GLOBAL",
                ModerationKind::ThreadHideBlock => "THREAD_HIDE_BLOCK",
                ModerationKind::ThreadShowFollow => "THREAD_SHOW_FOLLOW",
                ModerationKind::ThreadOnlyMention => "THREAD_ONLY_MENTION",
            },
            MessageKind::Connection(kind) => match kind {
                ConnectionKind::Follow => "FOLLOW",
                ConnectionKind::Block => "BLOCK",
                ConnectionKind::MemberInvite => "MEMBER_INVITE",
                ConnectionKind::MemberAccept => "MEMBER_ACCEPT",
            },
            MessageKind::Profile(kind) => match kind {
                ProfileKind::Name => "NAME",
                ProfileKind::Bio => "BIO",
                ProfileKind::ProfileImage => "PROFILE_IMAGE",
                ProfileKind::CoverImage => "COVER_IMAGE",
                ProfileKind::Website => "WEBSITE",
                ProfileKind::Group => "GROUP",
                ProfileKind::Custom => "CUSTOM",
            },
        }
    }
}

/// Parses `TYPE` or `TYPE:SUBTYPE`, case-insensitively, e.g. `post`,
/// `post:repost` or `moderation:like`. A bare type means subtype `DEFAULT`.
impl FromStr for MessageKind {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, subtype) = s.trim().split_once(':').unwrap_or((s.trim(), "DEFAULT"));
        serde_json::from_value(serde_json::json!({
            "type": kind.to_uppercase(),
            "subtype": subtype.to_uppercase(),
        }))
        .map_err(|e| NodeError::MalformedMessage(format!("unknown message kind '{s}': {e}")))
    }
}

/// An immutable protocol message.
///
/// The content address ([`Message::hash`]) is the SHA3-256 of the canonical
/// serialization, so two messages with identical canonical bytes are the same
/// message. Construct with [`Message::new`]; decoded messages are validated by
/// [`Envelope::decode`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    kind: MessageKind,
    creator: String,
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reference: Option<Hash32>,
    created_at: u64,
}

impl Message {
    /// Builds and validates a message. A non-empty `creator` is normalized.
    ///
    /// # Errors
    /// Returns [`NodeError::MalformedMessage`] if the creator is not an
    /// address, a moderation has no reference, or a connection has no target.
    pub fn new(
        kind: MessageKind,
        creator: &str,
        content: impl Into<String>,
        reference: Option<Hash32>,
        created_at: u64,
    ) -> Result<Self, NodeError> {
        let creator = if creator.is_empty() {
            String::new()
        } else {
            normalize_address(creator)?
        };
        let message = Self {
            kind,
            creator,
            content: content.into(),
            reference,
            created_at,
        };
        message.validate()?;
        Ok(message)
    }

    /// Structural checks applied to every message, constructed or decoded.
    ///
    /// # Errors
    /// See [`Message::new`].
    pub fn validate(&self) -> Result<(), NodeError> {
        if !self.creator.is_empty() && normalize_address(&self.creator)? != self.creator {
            return Err(NodeError::MalformedMessage(format!(
                "creator '{}' is not a normalized address",
                self.creator
            )));
        }
        match self.kind {
            MessageKind::Moderation(_) if self.reference.is_none() => Err(
                NodeError::MalformedMessage("moderation requires a reference".to_string()),
            ),
            MessageKind::Connection(_) if self.content.trim().is_empty() => Err(
                NodeError::MalformedMessage("connection requires a target".to_string()),
            ),
            _ => Ok(()),
        }
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    #[must_use]
    pub fn message_type(&self) -> MessageType {
        self.kind.message_type()
    }

    /// Normalized creator address, empty for anonymous messages.
    #[must_use]
    pub fn creator(&self) -> &str {
        &self.creator
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.creator.is_empty()
    }

    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    #[must_use]
    pub fn reference(&self) -> Option<&Hash32> {
        self.reference.as_ref()
    }

    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Canonical byte serialization hashed into the content address.
    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.creator.len() + self.content.len());
        out.push(CANONICAL_VERSION);
        push_field(&mut out, self.kind.message_type().as_str().as_bytes());
        push_field(&mut out, self.kind.subtype_tag().as_bytes());
        out.extend_from_slice(&self.created_at.to_be_bytes());
        push_field(&mut out, self.creator.as_bytes());
        push_field(&mut out, self.content.as_bytes());
        match &self.reference {
            Some(reference) => {
                out.push(1);
                out.extend_from_slice(reference.as_bytes());
            }
            None => out.push(0),
        }
        out
    }

    /// Content address of this message.
    #[must_use]
    pub fn hash(&self) -> Hash32 {
        Hash32(sha3_concat(&[&self.canonical_bytes()]))
    }
}

fn push_field(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

/// Direct authorship proof: an EIP-191 signature over the message hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureProof {
    /// 65-byte recoverable signature as hex.
    pub signature: String,
    pub address: String,
}

/// Anonymous authorship proof against a group's membership tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupProof {
    pub root: Hash32,
    pub nullifier: Hash32,
    pub external_nullifier: Hash32,
    #[serde(with = "hex::serde")]
    pub zk_proof: Vec<u8>,
}

/// Proof attached to every message. Nothing is stored without one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Proof {
    Signature(SignatureProof),
    Group(GroupProof),
}

impl Proof {
    #[must_use]
    pub fn scheme(&self) -> &'static str {
        match self {
            Proof::Signature(_) => "signature",
            Proof::Group(_) => "group",
        }
    }
}

/// Public inputs of a group-membership proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicSignals {
    pub root: Hash32,
    pub nullifier: Hash32,
    pub external_nullifier: Hash32,
    pub signal_hash: Hash32,
}

impl PublicSignals {
    #[must_use]
    pub fn for_message(proof: &GroupProof, message: &Message) -> Self {
        Self {
            root: proof.root,
            nullifier: proof.nullifier,
            external_nullifier: proof.external_nullifier,
            signal_hash: message.hash(),
        }
    }

    /// Instance column values, in circuit row order.
    ///
    /// The nullifier is a Poseidon output and is read back as its canonical
    /// field encoding; `None` if it is not one.
    #[must_use]
    pub fn to_fields(&self) -> Option<[pallas::Base; 4]> {
        Some([
            self.root.to_field(),
            field_from_repr(self.nullifier.0)?,
            self.external_nullifier.to_field(),
            self.signal_hash.to_field(),
        ])
    }
}

/// Versioned wire payload carrying a message and its proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u16,
    pub message: Message,
    pub proof: Proof,
}

impl Envelope {
    #[must_use]
    pub fn new(message: Message, proof: Proof) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            message,
            proof,
        }
    }

    /// # Errors
    /// Returns [`NodeError::MalformedMessage`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, NodeError> {
        serde_json::to_vec(self)
            .map_err(|e| NodeError::MalformedMessage(format!("failed to encode envelope: {e}")))
    }

    /// Decodes and validates a payload received from the network.
    ///
    /// # Errors
    /// Returns [`NodeError::MalformedMessage`] if the bytes do not parse, the
    /// version is unsupported, or the message fails structural validation.
    pub fn decode(bytes: &[u8]) -> Result<Self, NodeError> {
        debug!("Decoding envelope of {} bytes", bytes.len());
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| NodeError::MalformedMessage(format!("failed to decode envelope: {e}")))?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(NodeError::MalformedMessage(format!(
                "unsupported envelope version {} (expected {})",
                envelope.version, ENVELOPE_VERSION
            )));
        }
        envelope.message.validate()?;
        Ok(envelope)
    }

    #[must_use]
    pub fn into_parts(self) -> (Message, Proof) {
        (self.message, self.proof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CREATOR: &str = "0x742d35Cc6634C0532925a3b844Bc454e4438f44e";

    fn post(content: &str) -> Message {
        Message::new(
            MessageKind::Post(PostKind::Default),
            CREATOR,
            content,
            None,
            1_700_000_000_000,
        )
        .unwrap()
    }

    #[test]
    fn test_identical_messages_share_hash() {
        assert_eq!(post("hello").hash(), post("hello").hash());
    }

    #[test]
    fn test_hash_covers_every_field() {
        let base = post("hello");
        assert_ne!(base.hash(), post("hello!").hash());

        let reply = Message::new(
            MessageKind::Post(PostKind::Default),
            CREATOR,
            "hello",
            Some(base.hash()),
            base.created_at(),
        )
        .unwrap();
        assert_ne!(base.hash(), reply.hash());

        let anon = Message::new(
            MessageKind::Post(PostKind::Default),
            "",
            "hello",
            None,
            base.created_at(),
        )
        .unwrap();
        assert_ne!(base.hash(), anon.hash());

        let repost = Message::new(
            MessageKind::Post(PostKind::Repost),
            CREATOR,
            "hello",
            None,
            base.created_at(),
        )
        .unwrap();
        assert_ne!(base.hash(), repost.hash());
    }

    #[test]
    fn test_length_prefix_prevents_field_shifting() {
        let a = Message::new(MessageKind::Profile(ProfileKind::Name), "", "ab", None, 1).unwrap();
        let b = Message::new(MessageKind::Profile(ProfileKind::Bio), "", "ab", None, 1).unwrap();
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_creator_is_normalized() {
        let message = post("hello");
        assert_eq!(message.creator(), "742d35cc6634c0532925a3b844bc454e4438f44e");
    }

    #[test]
    fn test_moderation_requires_reference() {
        let result = Message::new(
            MessageKind::Moderation(ModerationKind::Like),
            CREATOR,
            "",
            None,
            1,
        );
        assert!(matches!(result, Err(NodeError::MalformedMessage(_))));
    }

    #[test]
    fn test_connection_requires_target() {
        let result = Message::new(
            MessageKind::Connection(ConnectionKind::Follow),
            CREATOR,
            "  ",
            None,
            1,
        );
        assert!(matches!(result, Err(NodeError::MalformedMessage(_))));
    }

    #[test]
    fn test_message_kind_from_str() {
        assert_eq!(
            "post".parse::<MessageKind>().unwrap(),
            MessageKind::Post(PostKind::Default)
        );
        assert_eq!(
            "MODERATION:thread_hide_block".parse::<MessageKind>().unwrap(),
            MessageKind::Moderation(ModerationKind::ThreadHideBlock)
        );
        assert!("moderation".parse::<MessageKind>().is_err());
        assert!("gossip:x".parse::<MessageKind>().is_err());
    }

    #[test]
    fn test_hash32_parse_and_display() {
        let hash = post("hello").hash();
        let parsed: Hash32 = format!("0x{hash}").parse().unwrap();
        assert_eq!(parsed, hash);
        assert!("0x1234".parse::<Hash32>().is_err());
        assert!("zz".parse::<Hash32>().is_err());
    }

    #[test]
    fn test_envelope_decode_preserves_hash() {
        let message = post("hello");
        let proof = Proof::Group(GroupProof {
            root: Hash32([1; 32]),
            nullifier: Hash32([2; 32]),
            external_nullifier: Hash32([3; 32]),
            zk_proof: vec![0xde, 0xad],
        });
        let bytes = Envelope::new(message.clone(), proof.clone()).encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded.message.hash(), message.hash());
        assert_eq!(decoded.proof, proof);
    }

    #[test]
    fn test_envelope_rejects_garbage_and_unknown_version() {
        assert!(matches!(
            Envelope::decode(b"not json"),
            Err(NodeError::MalformedMessage(_))
        ));

        let mut envelope = Envelope::new(
            post("hello"),
            Proof::Signature(SignatureProof {
                signature: String::new(),
                address: CREATOR.to_string(),
            }),
        );
        envelope.version = ENVELOPE_VERSION + 1;
        let bytes = serde_json::to_vec(&envelope).unwrap();
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(NodeError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_envelope_rejects_unnormalized_creator() {
        let json = format!(
            r#"{{"version":1,"message":{{"kind":{{"type":"POST","subtype":"DEFAULT"}},"creator":"{CREATOR}","content":"x","created_at":1}},"proof":{{"type":"signature","signature":"","address":""}}}}"#
        );
        assert!(matches!(
            Envelope::decode(json.as_bytes()),
            Err(NodeError::MalformedMessage(_))
        ));
    }
}
