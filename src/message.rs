//! Application messages carried inside custom-data frames.
//!
//! The device schema is a tagged union over six categories, each of which is
//! itself a oneof over named field groups. This module models that shape
//! without committing to the proprietary binary encoding: a [`MessageCodec`]
//! turns [`SubMessage`] values into bytes and back.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::HashMap, fmt, str::FromStr};

use crate::error::{MowerError, Result};

/// Command key of the BLE sync request
pub const BLE_SYNC_COMMAND: &str = "send_todev_ble_sync";

/// Command key of the base device info request
pub const BASE_INFO_COMMAND: &str = "get_device_base_info";

/// Net field groups that acknowledge a sync rather than answer a command
const SYNC_ACK_GROUPS: [&str; 2] = ["todev_ble_sync", "toapp_wifi_iot_status"];

/// Top-level message category
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Navigation, maps and task control
    Nav,
    /// System status and reporting
    Sys,
    /// Drive motors
    Driver,
    /// Network and link management
    Net,
    /// Multi-unit accessories
    Mul,
    /// Firmware updates
    Ota,
}

impl Category {
    /// Every category in wire order
    pub const ALL: [Self; 6] = [
        Self::Nav,
        Self::Sys,
        Self::Driver,
        Self::Net,
        Self::Mul,
        Self::Ota,
    ];

    /// Schema name of the category
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Nav => "nav",
            Self::Sys => "sys",
            Self::Driver => "driver",
            Self::Net => "net",
            Self::Mul => "mul",
            Self::Ota => "ota",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Category {
    type Err = MowerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|category| category.name() == s)
            .ok_or_else(|| MowerError::Codec(format!("unknown category '{s}'")))
    }
}

/// One populated variant of a category's oneof
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldGroup {
    /// Variant name, e.g. `toapp_report_data`
    pub name: String,
    /// Decoded field values
    pub value: Value,
}

impl FieldGroup {
    /// Create a field group
    #[must_use]
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// A single category's populated field group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubMessage {
    /// Navigation message
    Nav(FieldGroup),
    /// System message
    Sys(FieldGroup),
    /// Driver message
    Driver(FieldGroup),
    /// Network message
    Net(FieldGroup),
    /// Multi-unit message
    Mul(FieldGroup),
    /// OTA message
    Ota(FieldGroup),
}

impl SubMessage {
    /// Wrap a field group in its category variant
    #[must_use]
    pub const fn new(category: Category, group: FieldGroup) -> Self {
        match category {
            Category::Nav => Self::Nav(group),
            Category::Sys => Self::Sys(group),
            Category::Driver => Self::Driver(group),
            Category::Net => Self::Net(group),
            Category::Mul => Self::Mul(group),
            Category::Ota => Self::Ota(group),
        }
    }

    /// Category of this message
    #[must_use]
    pub const fn category(&self) -> Category {
        match self {
            Self::Nav(_) => Category::Nav,
            Self::Sys(_) => Category::Sys,
            Self::Driver(_) => Category::Driver,
            Self::Net(_) => Category::Net,
            Self::Mul(_) => Category::Mul,
            Self::Ota(_) => Category::Ota,
        }
    }

    /// The populated field group
    #[must_use]
    pub const fn group(&self) -> &FieldGroup {
        match self {
            Self::Nav(group)
            | Self::Sys(group)
            | Self::Driver(group)
            | Self::Net(group)
            | Self::Mul(group)
            | Self::Ota(group) => group,
        }
    }

    /// Whether this acknowledges a BLE sync instead of answering a command
    #[must_use]
    pub fn is_sync_ack(&self) -> bool {
        matches!(self, Self::Net(group) if SYNC_ACK_GROUPS.contains(&group.name.as_str()))
    }
}

/// A decoded device message
///
/// Well-formed traffic populates exactly one category.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceMessage {
    /// Populated categories
    pub parts: Vec<SubMessage>,
}

impl DeviceMessage {
    /// Message with a single populated category
    #[must_use]
    pub fn from_part(part: SubMessage) -> Self {
        Self { parts: vec![part] }
    }

    /// The single populated category
    ///
    /// Returns `Ok(None)` for an empty message.
    ///
    /// # Errors
    ///
    /// Returns [`MowerError::AmbiguousMessage`] if more than one category is
    /// populated.
    pub fn single(&self) -> Result<Option<&SubMessage>> {
        match self.parts.as_slice() {
            [] => Ok(None),
            [part] => Ok(Some(part)),
            parts => Err(MowerError::AmbiguousMessage(parts.len())),
        }
    }

    /// Whether the message is a sync acknowledgement
    #[must_use]
    pub fn is_sync_ack(&self) -> bool {
        matches!(self.parts.as_slice(), [part] if part.is_sync_ack())
    }
}

/// Application message encoding
pub trait MessageCodec: Send + Sync {
    /// Encode one category's field group
    ///
    /// # Errors
    ///
    /// Returns [`MowerError::Codec`] if the message cannot be encoded.
    fn encode(&self, message: &SubMessage) -> Result<Bytes>;

    /// Decode a logical message payload
    ///
    /// # Errors
    ///
    /// Returns [`MowerError::Codec`] if the payload is not a valid message.
    fn decode(&self, data: &[u8]) -> Result<DeviceMessage>;
}

/// JSON stand-in for the binary schema
///
/// Messages are objects keyed by category, each holding an object keyed by
/// field group: `{"net": {"todev_ble_sync": 2}}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode(&self, message: &SubMessage) -> Result<Bytes> {
        let group = message.group();
        let mut inner = Map::new();
        inner.insert(group.name.clone(), group.value.clone());
        let mut outer = Map::new();
        outer.insert(message.category().name().to_string(), Value::Object(inner));

        Ok(Bytes::from(serde_json::to_vec(&Value::Object(outer))?))
    }

    fn decode(&self, data: &[u8]) -> Result<DeviceMessage> {
        let value: Value = serde_json::from_slice(data)
            .map_err(|e| MowerError::Codec(format!("invalid message payload: {e}")))?;
        let Value::Object(categories) = value else {
            return Err(MowerError::Codec("message is not an object".to_string()));
        };

        let mut parts = Vec::new();
        for (key, groups) in categories {
            let category: Category = key.parse()?;
            let Value::Object(groups) = groups else {
                return Err(MowerError::Codec(format!(
                    "category '{category}' does not hold field groups"
                )));
            };
            for (name, value) in groups {
                parts.push(SubMessage::new(category, FieldGroup { name, value }));
            }
        }

        Ok(DeviceMessage { parts })
    }
}

/// How a command key maps onto the schema
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    /// Category the request is sent in
    pub category: Category,
    /// Field group populated by the request
    pub group: String,
    /// Field values used when the caller does not override them
    pub defaults: Value,
}

/// Registry of named commands
#[derive(Debug, Clone, Default)]
pub struct CommandCatalog {
    entries: HashMap<String, CommandSpec>,
}

impl CommandCatalog {
    /// Create an empty catalog
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the lifecycle requests and common task controls
    #[must_use]
    pub fn standard() -> Self {
        let task = |action: u8| serde_json::json!({ "type": 1, "action": action });

        Self::new()
            .with(BLE_SYNC_COMMAND, Category::Net, "todev_ble_sync", Value::from(2))
            .with(
                BASE_INFO_COMMAND,
                Category::Net,
                "todev_devinfo_req",
                serde_json::json!({ "req_ids": [{ "id": 1, "type": 1 }] }),
            )
            .with(
                "get_report_info",
                Category::Sys,
                "todev_report_cfg",
                serde_json::json!({ "act": 2, "sub": [{ "type": 3 }] }),
            )
            .with("start_job", Category::Nav, "todev_taskctrl", task(1))
            .with("pause_execute_task", Category::Nav, "todev_taskctrl", task(2))
            .with("resume_execute_task", Category::Nav, "todev_taskctrl", task(3))
            .with("cancel_job", Category::Nav, "todev_taskctrl", task(4))
            .with("return_to_dock", Category::Nav, "todev_taskctrl", task(5))
    }

    /// Register a command, replacing any entry with the same key
    #[must_use]
    pub fn with(
        mut self,
        key: impl Into<String>,
        category: Category,
        group: impl Into<String>,
        defaults: Value,
    ) -> Self {
        self.register(key, category, group, defaults);
        self
    }

    /// Register a command in place
    pub fn register(
        &mut self,
        key: impl Into<String>,
        category: Category,
        group: impl Into<String>,
        defaults: Value,
    ) {
        self.entries.insert(
            key.into(),
            CommandSpec {
                category,
                group: group.into(),
                defaults,
            },
        );
    }

    /// Look up a command
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&CommandSpec> {
        self.entries.get(key)
    }

    /// Registered command keys, sorted
    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Build the message for a command
    ///
    /// Object arguments overlay the defaults field by field; any other
    /// non-null argument replaces them.
    ///
    /// # Errors
    ///
    /// Returns [`MowerError::UnknownCommand`] if the key is not registered,
    /// or [`MowerError::InvalidParameters`] if object arguments are given
    /// for a command whose defaults are not an object.
    pub fn build(&self, key: &str, args: &Value) -> Result<SubMessage> {
        let spec = self
            .get(key)
            .ok_or_else(|| MowerError::UnknownCommand(key.to_string()))?;

        let value = match (&spec.defaults, args) {
            (defaults, Value::Null) => defaults.clone(),
            (Value::Object(defaults), Value::Object(overrides)) => {
                let mut merged = defaults.clone();
                for (field, value) in overrides {
                    merged.insert(field.clone(), value.clone());
                }
                Value::Object(merged)
            }
            (Value::Null, value) => value.clone(),
            (defaults, Value::Object(_)) => {
                return Err(MowerError::InvalidParameters(format!(
                    "'{key}' takes a single value, got an object (default {defaults})"
                )));
            }
            (_, value) => value.clone(),
        };

        Ok(SubMessage::new(
            spec.category,
            FieldGroup::new(spec.group.clone(), value),
        ))
    }
}
