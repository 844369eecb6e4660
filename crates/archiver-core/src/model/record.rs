//! Archived record shapes, one JSON object per artifact line.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::archive::ArchiveType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRef {
    pub uuid: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRef {
    pub uuid: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRef {
    pub uuid: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub content_type: String,
    pub url: String,
}

impl Attachment {
    /// Parse the `content-type:url` form used by the live store.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((content_type, url)) if content_type.contains('/') => {
                Self {
                    content_type: content_type.to_string(),
                    url: url.to_string(),
                }
            }
            _ => Self {
                content_type: String::new(),
                url: raw.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub uuid: String,
    pub contact: ContactRef,
    pub urn: Option<String>,
    pub channel: Option<ChannelRef>,
    pub direction: Direction,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub status: String,
    pub visibility: String,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub labels: Vec<String>,
    pub created_on: DateTime<Utc>,
    pub sent_on: Option<DateTime<Utc>>,
    pub modified_on: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathStep {
    pub node: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunValue {
    pub name: String,
    pub value: String,
    pub category: Option<String>,
    pub node: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: i64,
    pub uuid: String,
    pub flow: FlowRef,
    pub contact: ContactRef,
    pub responded: bool,
    pub path: Vec<PathStep>,
    pub values: BTreeMap<String, RunValue>,
    pub events: Vec<serde_json::Value>,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
    pub exited_on: Option<DateTime<Utc>>,
    pub exit_type: Option<String>,
    pub submitted_by: Option<String>,
}

/// A single archived record of either type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Record {
    Message(MessageRecord),
    Run(RunRecord),
}

impl Record {
    #[must_use]
    pub const fn archive_type(&self) -> ArchiveType {
        match self {
            Self::Message(_) => ArchiveType::Message,
            Self::Run(_) => ArchiveType::Run,
        }
    }

    /// Strip contact-identifying fields for anonymized tenants.
    pub fn anonymize(&mut self) {
        match self {
            Self::Message(msg) => {
                msg.contact.name = None;
                msg.urn = None;
            }
            Self::Run(run) => {
                run.contact.name = None;
                run.submitted_by = None;
            }
        }
    }
}
