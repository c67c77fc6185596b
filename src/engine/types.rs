//! Typed views of engine RPC results.
//!
//! aria2 encodes numbers and booleans as JSON strings (`"1024"`, `"true"`).
//! The decoders here accept both the string and the native encoding.

use std::fmt;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    String(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BoolOrString {
    Bool(bool),
    String(String),
}

fn de_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(value) => Ok(value),
        NumberOrString::String(text) => text
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("invalid number: {text:?}"))),
    }
}

fn de_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match BoolOrString::deserialize(deserializer)? {
        BoolOrString::Bool(value) => Ok(value),
        BoolOrString::String(text) => match text.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(de::Error::custom(format!("invalid boolean: {text:?}"))),
        },
    }
}

/// State of one transfer inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Active,
    Waiting,
    Paused,
    Error,
    Complete,
    Removed,
}

impl TransferState {
    /// Returns the wire representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Waiting => "waiting",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Complete => "complete",
            Self::Removed => "removed",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of `aria2.tellStatus` restricted to the keys the scheduler asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub gid: String,
    pub status: TransferState,
    #[serde(deserialize_with = "de_u64")]
    pub total_length: u64,
    #[serde(deserialize_with = "de_u64")]
    pub completed_length: u64,
    /// Bytes per second.
    #[serde(deserialize_with = "de_u64")]
    pub download_speed: u64,
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl TaskStatus {
    /// Keys requested from `aria2.tellStatus`.
    pub const KEYS: [&'static str; 8] = [
        "gid",
        "status",
        "totalLength",
        "completedLength",
        "downloadSpeed",
        "dir",
        "errorCode",
        "errorMessage",
    ];

    /// Completed percentage in `0..=100`; zero when the size is still unknown.
    #[must_use]
    pub fn percent(&self) -> u64 {
        if self.total_length == 0 {
            return 0;
        }
        (self.completed_length.min(self.total_length) * 100) / self.total_length
    }
}

/// Source URI of a file entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UriEntry {
    /// `used` or `waiting`.
    pub status: UriState,
    pub uri: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UriState {
    Used,
    Waiting,
}

/// One element of `aria2.getFiles`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    #[serde(deserialize_with = "de_u64")]
    pub index: u64,
    pub path: String,
    #[serde(deserialize_with = "de_u64")]
    pub length: u64,
    #[serde(deserialize_with = "de_u64")]
    pub completed_length: u64,
    #[serde(deserialize_with = "de_bool")]
    pub selected: bool,
    #[serde(default)]
    pub uris: Vec<UriEntry>,
}

/// Result of `aria2.getGlobalStat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStat {
    #[serde(deserialize_with = "de_u64")]
    pub download_speed: u64,
    #[serde(deserialize_with = "de_u64")]
    pub upload_speed: u64,
    #[serde(deserialize_with = "de_u64")]
    pub num_active: u64,
    #[serde(deserialize_with = "de_u64")]
    pub num_waiting: u64,
    #[serde(deserialize_with = "de_u64")]
    pub num_stopped: u64,
    #[serde(deserialize_with = "de_u64")]
    pub num_stopped_total: u64,
}

/// Result of `aria2.getVersion`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: String,
    #[serde(default)]
    pub enabled_features: Vec<String>,
}

/// Result of `aria2.getSessionInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
}
