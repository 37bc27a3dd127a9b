//! Write Commands
//!
//! Wire shape of a command on the bus:
//! `{"action": "saveEntry", "params": {...}, "correlationId": "..."}`.
//! The envelope is parsed first so a bad payload can still be answered
//! under its correlation id.

use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::{ImageParam, LangContent};

pub const ACTION_SAVE_ENTRY: &str = "saveEntry";
pub const ACTION_RM_ENTRY: &str = "rmEntry";
pub const ACTION_SET_IMAGES: &str = "setImages";

/// Raw command as published on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub action: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default, alias = "uuid")]
    pub correlation_id: Option<String>,
}

impl CommandEnvelope {
    /// Wrap a command under a correlation id
    pub fn new(command: &Command, correlation_id: impl Into<String>) -> Result<Self> {
        Ok(Self {
            action: command.action().to_string(),
            params: command.params()?,
            correlation_id: Some(correlation_id.into()),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A parsed write command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SaveEntry(SaveEntryParams),
    RmEntry(RmEntryParams),
    SetImages(SetImagesParams),
}

impl Command {
    pub fn action(&self) -> &'static str {
        match self {
            Command::SaveEntry(_) => ACTION_SAVE_ENTRY,
            Command::RmEntry(_) => ACTION_RM_ENTRY,
            Command::SetImages(_) => ACTION_SET_IMAGES,
        }
    }

    /// Parse the params of an envelope according to its action
    pub fn from_envelope(envelope: &CommandEnvelope) -> Result<Self> {
        fn params<T: serde::de::DeserializeOwned>(envelope: &CommandEnvelope) -> Result<T> {
            serde_json::from_value(envelope.params.clone()).map_err(|e| {
                Error::InvalidCommand(format!("{} params: {}", envelope.action, e))
            })
        }

        match envelope.action.as_str() {
            ACTION_SAVE_ENTRY => Ok(Command::SaveEntry(params(envelope)?)),
            ACTION_RM_ENTRY => Ok(Command::RmEntry(params(envelope)?)),
            ACTION_SET_IMAGES => Ok(Command::SetImages(params(envelope)?)),
            other => Err(Error::UnknownCommand(other.to_string())),
        }
    }

    fn params(&self) -> Result<serde_json::Value> {
        let value = match self {
            Command::SaveEntry(p) => serde_json::to_value(p)?,
            Command::RmEntry(p) => serde_json::to_value(p)?,
            Command::SetImages(p) => serde_json::to_value(p)?,
        };
        Ok(value)
    }
}

/// Entry id as carried by a command, validated before any write
pub fn parse_entry_id(uuid: Option<&str>) -> Result<Uuid> {
    let raw = uuid.ok_or(Error::MissingEntryId)?;
    Uuid::parse_str(raw.trim()).map_err(|_| Error::InvalidEntryId(raw.to_string()))
}

/// Distinguishes an explicit `null` from an absent field
fn deserialize_some<'de, T, D>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaveEntryParams {
    #[serde(default)]
    pub uuid: Option<String>,
    /// Absent leaves the publish time alone, `null` unpublishes
    #[serde(
        default,
        deserialize_with = "deserialize_some",
        skip_serializing_if = "Option::is_none"
    )]
    pub published: Option<Option<DateTime<Utc>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub langs: Option<BTreeMap<String, LangContent>>,
}

impl SaveEntryParams {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid: Some(uuid.to_string()),
            ..Self::default()
        }
    }

    pub fn published(mut self, published: Option<DateTime<Utc>>) -> Self {
        self.published = Some(published);
        self
    }

    pub fn lang(mut self, lang: impl Into<String>, content: LangContent) -> Self {
        self.langs
            .get_or_insert_with(BTreeMap::new)
            .insert(lang.into(), content);
        self
    }

    pub fn entry_id(&self) -> Result<Uuid> {
        parse_entry_id(self.uuid.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RmEntryParams {
    #[serde(default)]
    pub uuid: Option<String>,
}

impl RmEntryParams {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid: Some(uuid.to_string()),
        }
    }

    pub fn entry_id(&self) -> Result<Uuid> {
        parse_entry_id(self.uuid.as_deref())
    }
}

fn default_delete() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetImagesParams {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub images: Option<Vec<ImageParam>>,
    /// Drop existing images before inserting
    #[serde(rename = "delete", default = "default_delete")]
    pub delete_existing: bool,
}

impl SetImagesParams {
    pub fn new(uuid: Uuid, images: Vec<ImageParam>) -> Self {
        Self {
            uuid: Some(uuid.to_string()),
            images: Some(images),
            delete_existing: true,
        }
    }

    pub fn entry_id(&self) -> Result<Uuid> {
        parse_entry_id(self.uuid.as_deref())
    }

    pub fn images(&self) -> &[ImageParam] {
        self.images.as_deref().unwrap_or(&[])
    }
}
