use std::fmt::{self, Display};

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::{
    message::{DecodeError, Reader, WireFields, Writer},
    protocol::{NODE_ID_MAX_SIZE, TOKEN_SIZE},
};

/// Indicates that a string cannot be used as a [`NodeId`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Node id must be 1 to {NODE_ID_MAX_SIZE} bytes of UTF-8, got {0} bytes")]
pub struct InvalidNodeId(pub usize);

/// Identifier of a client, a group or a sync point.
///
/// Node ids consist of 1 to 32 bytes of UTF-8 and are compared by their string
/// content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidNodeId> {
        let id = id.into();
        if id.is_empty() || id.len() > NODE_ID_MAX_SIZE {
            return Err(InvalidNodeId(id.len()));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for NodeId {
    type Error = InvalidNodeId;

    fn try_from(id: &str) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

impl std::str::FromStr for NodeId {
    type Err = InvalidNodeId;

    fn from_str(id: &str) -> Result<Self, Self::Err> {
        Self::new(id)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl WireFields for NodeId {
    fn encoded_len(&self) -> usize {
        4 + self.0.len()
    }

    fn encode(&self, writer: &mut Writer) {
        writer.put_i32(self.0.len() as i32);
        writer.put_bytes(self.0.as_bytes());
    }

    fn decode(reader: &mut Reader) -> Result<Self, DecodeError> {
        let length = reader.get_i32()?;
        let length = usize::try_from(length)
            .ok()
            .filter(|length| (1..=NODE_ID_MAX_SIZE).contains(length))
            .ok_or(DecodeError::InvalidNodeIdLength(length))?;
        let bytes = reader.get_bytes(length)?;
        let id = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidNodeIdEncoding)?;
        Ok(Self(id.to_owned()))
    }
}

/// A 32 byte opaque secret.
///
/// Tokens guard against accidental collisions between groups and clients, they
/// are not meant as a security boundary. Equality is a plain content
/// comparison.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token([u8; TOKEN_SIZE]);

impl Token {
    /// The "no token" sentinel. [`Token::random`] never returns it.
    pub const NULL: Token = Token([0; TOKEN_SIZE]);

    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let mut bytes = [0; TOKEN_SIZE];
            rng.fill_bytes(&mut bytes);
            let token = Self(bytes);
            if token != Self::NULL {
                return token;
            }
        }
    }

    /// Derives a token from a shared secret by hashing it with SHA-256.
    pub fn from_secret(secret: &str) -> Self {
        Self(Sha256::digest(secret.as_bytes()).into())
    }

    pub fn from_bytes(bytes: [u8; TOKEN_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_SIZE] {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token(")?;
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

impl WireFields for Token {
    fn encoded_len(&self) -> usize {
        TOKEN_SIZE
    }

    fn encode(&self, writer: &mut Writer) {
        writer.put_bytes(&self.0);
    }

    fn decode(reader: &mut Reader) -> Result<Self, DecodeError> {
        let mut bytes = [0; TOKEN_SIZE];
        bytes.copy_from_slice(reader.get_bytes(TOKEN_SIZE)?);
        Ok(Self(bytes))
    }
}
