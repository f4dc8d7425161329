//! Device state aggregation.
//!
//! The device reports its state as a stream of partial updates, one field
//! group at a time. [`DeviceStateStore`] folds them into a single
//! [`DeviceSnapshot`] and publishes every change on a `watch` channel.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::watch;
use tracing::debug;

use crate::{
    error::Result,
    message::{Category, DeviceMessage, SubMessage},
};

/// Merged view of everything the device has reported
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    /// Incremented on every change
    pub revision: u64,
    /// Time of the last change
    pub updated_at: Option<DateTime<Utc>>,
    categories: BTreeMap<Category, BTreeMap<String, Value>>,
}

impl DeviceSnapshot {
    /// Latest value of a field group
    #[must_use]
    pub fn get(&self, category: Category, group: &str) -> Option<&Value> {
        self.categories.get(&category)?.get(group)
    }

    /// All field groups stored for a category
    #[must_use]
    pub fn category(&self, category: Category) -> Option<&BTreeMap<String, Value>> {
        self.categories.get(&category)
    }

    /// Whether nothing has been merged yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// Whole snapshot as `{category: {group: value}}`
    #[must_use]
    pub fn to_json(&self) -> Value {
        let categories = self
            .categories
            .iter()
            .map(|(category, groups)| {
                let groups: Map<String, Value> = groups
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect();
                (category.name().to_string(), Value::Object(groups))
            })
            .collect();
        Value::Object(categories)
    }
}

/// Folds partial updates into one snapshot
#[derive(Debug, Clone)]
pub struct DeviceStateStore {
    sender: Arc<watch::Sender<Arc<DeviceSnapshot>>>,
}

impl DeviceStateStore {
    /// Create a store holding an empty snapshot
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(Arc::new(DeviceSnapshot::default()));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Merge a decoded message
    ///
    /// Returns the category that was updated, or `None` for an empty message.
    /// Only the arriving field group is replaced; siblings stay untouched.
    ///
    /// # Errors
    ///
    /// Returns [`crate::MowerError::AmbiguousMessage`] if more than one
    /// category is populated. The snapshot is left unchanged.
    pub fn merge(&self, message: &DeviceMessage) -> Result<Option<Category>> {
        let Some(part) = message.single()? else {
            return Ok(None);
        };
        self.merge_part(part);
        Ok(Some(part.category()))
    }

    /// Merge one category's field group
    ///
    /// Returns whether the snapshot changed.
    pub fn merge_part(&self, part: &SubMessage) -> bool {
        let category = part.category();
        let group = part.group();

        let changed = self.sender.send_if_modified(|snapshot| {
            if snapshot.get(category, &group.name) == Some(&group.value) {
                return false;
            }

            let next = Arc::make_mut(snapshot);
            next.categories
                .entry(category)
                .or_default()
                .insert(group.name.clone(), group.value.clone());
            next.revision += 1;
            next.updated_at = Some(Utc::now());
            true
        });

        if changed {
            debug!("Merged {}.{}", category, group.name);
        }
        changed
    }

    /// Current snapshot, valid until the next merge
    #[must_use]
    pub fn snapshot(&self) -> Arc<DeviceSnapshot> {
        self.sender.borrow().clone()
    }

    /// Receive every future snapshot
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<DeviceSnapshot>> {
        self.sender.subscribe()
    }

    /// Start over with an empty snapshot
    pub fn reset(&self) {
        self.sender.send_modify(|snapshot| {
            *snapshot = Arc::new(DeviceSnapshot {
                revision: snapshot.revision + 1,
                ..DeviceSnapshot::default()
            });
        });
    }
}

impl Default for DeviceStateStore {
    fn default() -> Self {
        Self::new()
    }
}
