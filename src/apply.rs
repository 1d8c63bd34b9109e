//! Idempotent create-or-update of a single managed object.
//!
//! The object is created if absent. If it already exists, the live copy is
//! read, the fields this manager owns are merged into it and the result is
//! written back with the resourceVersion that was read. A write racing with
//! another writer fails with a conflict and is re-read, up to
//! `max_conflict_retries` times. Nothing is written when the merged object
//! equals the live one.
//!
//! Every write records the applied labels, annotations and owned fields in
//! the [`LAST_APPLIED_ANNOTATION`]. On the next update, keys present in that
//! record but missing from the desired state are removed from the live
//! object; keys the manager never wrote are left alone.

use std::collections::BTreeMap;

use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::Display;
use tracing::{debug, warn};

use crate::{
    cluster::{ClusterClient, ClusterError},
    resources::{ManagedResource, OwnedField},
};

pub const LAST_APPLIED_ANNOTATION: &str = "lambda-service-manager/last-applied";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
struct AppliedRecord {
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
    #[serde(default)]
    fields: Map<String, Value>,
}

impl AppliedRecord {
    fn of(desired: &DynamicObject, owned: &[OwnedField]) -> Self {
        let mut annotations = desired.metadata.annotations.clone().unwrap_or_default();
        annotations.remove(LAST_APPLIED_ANNOTATION);
        let fields = owned
            .iter()
            .filter_map(|field| {
                desired
                    .data
                    .get(field.name())
                    .map(|value| (field.name().to_string(), value.clone()))
            })
            .collect();
        Self {
            labels: desired.metadata.labels.clone().unwrap_or_default(),
            annotations,
            fields,
        }
    }

    fn from_object(object: &DynamicObject) -> Option<Self> {
        let raw = object
            .metadata
            .annotations
            .as_ref()?
            .get(LAST_APPLIED_ANNOTATION)?;
        match serde_json::from_str(raw) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(name = ?object.metadata.name, error = %err, "ignoring unreadable last-applied record");
                None
            }
        }
    }
}

/// Result of one create-or-update round.
enum Attempt {
    Done(Result<ApplyOutcome, ClusterError>),
    /// Lost a race with another writer; worth re-reading.
    Raced(ClusterError),
}

pub async fn apply_resource(
    client: &dyn ClusterClient,
    resource: &dyn ManagedResource,
    max_conflict_retries: u32,
) -> Result<ApplyOutcome, ClusterError> {
    let kind = resource.kind();
    let name = resource.key();
    let desired = resource
        .build_desired_state()
        .and_then(|desired| with_applied_record(desired, resource.owned_fields()))
        .map_err(|source| ClusterError::Encoding {
            kind,
            name: name.to_string(),
            source,
        })?;

    let mut retries = 0;
    loop {
        match create_or_update(client, resource, &desired).await {
            Attempt::Done(result) => return result,
            Attempt::Raced(err) if retries < max_conflict_retries => {
                retries += 1;
                debug!(%kind, %name, retries, error = %err, "object changed concurrently, re-reading");
            }
            Attempt::Raced(err) => return Err(err),
        }
    }
}

async fn create_or_update(
    client: &dyn ClusterClient,
    resource: &dyn ManagedResource,
    desired: &DynamicObject,
) -> Attempt {
    let kind = resource.kind();
    let name = resource.key();

    match client.create(kind, desired).await {
        Ok(_) => return Attempt::Done(Ok(ApplyOutcome::Created)),
        Err(err) if err.is_already_exists() => {}
        Err(err) => return Attempt::Done(Err(err)),
    }

    let current = match client.get(kind, name).await {
        Ok(Some(current)) => current,
        // deleted between the failed create and the read
        Ok(None) => {
            return Attempt::Raced(ClusterError::NotFound {
                kind,
                name: name.to_string(),
            });
        }
        Err(err) => return Attempt::Done(Err(err)),
    };

    let merged = merge_owned_fields(&current, desired, resource.owned_fields());
    if is_unchanged(&current, &merged) {
        return Attempt::Done(Ok(ApplyOutcome::Unchanged));
    }
    match client.replace(kind, &merged).await {
        Ok(_) => Attempt::Done(Ok(ApplyOutcome::Updated)),
        Err(err) if err.is_conflict() || err.is_not_found() => Attempt::Raced(err),
        Err(err) => Attempt::Done(Err(err)),
    }
}

fn with_applied_record(
    mut desired: DynamicObject,
    owned: &[OwnedField],
) -> serde_json::Result<DynamicObject> {
    let record = serde_json::to_string(&AppliedRecord::of(&desired, owned))?;
    desired
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(LAST_APPLIED_ANNOTATION.to_string(), record);
    Ok(desired)
}

/// Overlays the desired labels, annotations and owned fields onto the live
/// object. Identity, resourceVersion, status and fields owned by others are
/// taken from `current`. Keys recorded as applied by the previous write but
/// absent from `desired` are removed.
pub fn merge_owned_fields(
    current: &DynamicObject,
    desired: &DynamicObject,
    owned: &[OwnedField],
) -> DynamicObject {
    let previous = AppliedRecord::from_object(current).unwrap_or_default();

    let mut merged = current.clone();
    if merged.types.is_none() {
        merged.types = desired.types.clone();
    }
    merged.metadata.labels = overlay(
        &current.metadata.labels,
        &desired.metadata.labels,
        &previous.labels,
    );
    merged.metadata.annotations = overlay(
        &current.metadata.annotations,
        &desired.metadata.annotations,
        &previous.annotations,
    );

    if !merged.data.is_object() {
        merged.data = Value::Object(Map::new());
    }
    if let Value::Object(body) = &mut merged.data {
        for field in owned {
            let name = field.name();
            let Some(wanted) = desired.data.get(name) else {
                body.remove(name);
                continue;
            };
            let value = match field {
                OwnedField::Replace(_) => wanted.clone(),
                OwnedField::Merge(_) => {
                    let mut value = merge_values(current.data.get(name), wanted);
                    if let Some(applied) = previous.fields.get(name) {
                        prune_removed(&mut value, applied, wanted);
                    }
                    value
                }
            };
            body.insert(name.to_string(), value);
        }
    }
    merged
}

fn overlay(
    current: &Option<BTreeMap<String, String>>,
    desired: &Option<BTreeMap<String, String>>,
    previously_applied: &BTreeMap<String, String>,
) -> Option<BTreeMap<String, String>> {
    let empty = BTreeMap::new();
    let desired_map = desired.as_ref().unwrap_or(&empty);
    let stale: Vec<&String> = previously_applied
        .keys()
        .filter(|key| !desired_map.contains_key(*key))
        .collect();

    match (current, desired) {
        (None, None) => None,
        (None, Some(desired)) => Some(desired.clone()),
        (Some(current), desired) => {
            let mut merged = current.clone();
            for key in stale {
                merged.remove(key);
            }
            if let Some(desired) = desired {
                merged.extend(desired.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            Some(merged)
        }
    }
}

/// Recursive merge: objects are merged key by key, arrays of equal length
/// element by element, anything else is replaced by `desired`.
fn merge_values(current: Option<&Value>, desired: &Value) -> Value {
    match (current, desired) {
        (Some(Value::Object(current)), Value::Object(desired)) => {
            let mut merged = current.clone();
            for (key, value) in desired {
                merged.insert(key.clone(), merge_values(current.get(key), value));
            }
            Value::Object(merged)
        }
        (Some(Value::Array(current)), Value::Array(desired)) if current.len() == desired.len() => {
            Value::Array(
                current
                    .iter()
                    .zip(desired)
                    .map(|(current, desired)| merge_values(Some(current), desired))
                    .collect(),
            )
        }
        _ => desired.clone(),
    }
}

/// Removes from `target` every key that `applied` holds and `desired` no
/// longer does, walking objects by key and arrays by index.
fn prune_removed(target: &mut Value, applied: &Value, desired: &Value) {
    match (target, applied, desired) {
        (Value::Object(target), Value::Object(applied), Value::Object(desired)) => {
            for (key, applied_value) in applied {
                match desired.get(key) {
                    None => {
                        target.remove(key);
                    }
                    Some(desired_value) => {
                        if let Some(target_value) = target.get_mut(key) {
                            prune_removed(target_value, applied_value, desired_value);
                        }
                    }
                }
            }
        }
        (Value::Array(target), Value::Array(applied), Value::Array(desired)) => {
            for ((target, applied), desired) in target.iter_mut().zip(applied).zip(desired) {
                prune_removed(target, applied, desired);
            }
        }
        _ => {}
    }
}

fn is_unchanged(current: &DynamicObject, merged: &DynamicObject) -> bool {
    current.metadata.labels == merged.metadata.labels &&
        current.metadata.annotations == merged.metadata.annotations &&
        current.data == merged.data
}
