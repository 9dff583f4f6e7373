//! Credential Models
//! Mission: Define the claim set and credential pair exchanged with callers

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Claim carrying the credential type marker.
pub const TYPE_CLAIM: &str = "type";
/// Claim carrying the principal identifier on refresh-derived credentials.
pub const ID_CLAIM: &str = "id";
pub const EXP_CLAIM: &str = "exp";
pub const IAT_CLAIM: &str = "iat";
pub const JTI_CLAIM: &str = "jti";

/// Claim names owned by the token service; caller values are overwritten.
pub const RESERVED_CLAIMS: [&str; 4] = [TYPE_CLAIM, EXP_CLAIM, IAT_CLAIM, JTI_CLAIM];

/// Which half of a credential pair a token is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialType {
    Access,
    Refresh,
}

impl CredentialType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialType::Access => "access",
            CredentialType::Refresh => "refresh",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "access" => Some(CredentialType::Access),
            "refresh" => Some(CredentialType::Refresh),
            _ => None,
        }
    }
}

impl fmt::Display for CredentialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded claim set: arbitrary caller claims plus the service's reserved ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Claims(Map<String, Value>);

impl Claims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn credential_type(&self) -> Option<CredentialType> {
        self.get(TYPE_CLAIM)
            .and_then(Value::as_str)
            .and_then(CredentialType::from_str)
    }

    /// Principal identifier (`id`), when it is a string.
    pub fn principal_id(&self) -> Option<&str> {
        self.get(ID_CLAIM).and_then(Value::as_str)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let exp = self.get(EXP_CLAIM).and_then(Value::as_i64)?;
        Utc.timestamp_opt(exp, 0).single()
    }

    pub fn token_id(&self) -> Option<&str> {
        self.get(JTI_CLAIM).and_then(Value::as_str)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Copy without reserved claims, i.e. what the caller originally supplied.
    pub fn caller_claims(&self) -> Claims {
        let mut out = self.clone();
        for key in RESERVED_CLAIMS {
            out.0.remove(key);
        }
        out
    }
}

impl From<Map<String, Value>> for Claims {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Access + refresh credential issued together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Decoded expiry of the access credential
    pub expires_at: DateTime<Utc>,
}
