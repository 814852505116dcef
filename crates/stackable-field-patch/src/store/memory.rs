//! An in-memory API server, tracking field ownership the way server-side apply does.
//!
//! Lists are treated as atomic values, which is what the API server does for lists without
//! merge keys.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

use async_trait::async_trait;
use kube::core::DynamicObject;
use serde_json::{Value, json};

use super::{ObjectStore, Rejection, StoreError, StorePatch, WriteMode};
use crate::{
    managed_fields::FieldNode,
    merge::deep_merge,
    path::{FieldPath, PathSegment},
    target::TargetRef,
};

const CLUSTER_SCOPED_KINDS: &[&str] = &["Namespace", "ClusterRole", "StorageClass"];

/// Fields which are never owned by any manager.
const UNOWNED_FIELDS: &[&[&str]] = &[
    &["apiVersion"],
    &["kind"],
    &["metadata", "name"],
    &["metadata", "namespace"],
    &["metadata", "managedFields"],
    &["metadata", "resourceVersion"],
    &["metadata", "uid"],
    &["metadata", "creationTimestamp"],
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Operation {
    Apply,
    Update,
}

#[derive(Clone, Debug)]
struct ManagerEntry {
    manager: String,
    operation: Operation,
    fields: BTreeSet<FieldPath>,
}

#[derive(Clone, Debug)]
struct StoredObject {
    body: Value,
    entries: Vec<ManagerEntry>,
    resource_version: u64,
}

impl StoredObject {
    fn entry_mut(&mut self, manager: &str, operation: Operation) -> &mut ManagerEntry {
        let position = self
            .entries
            .iter()
            .position(|entry| entry.manager == manager && entry.operation == operation);
        let position = position.unwrap_or_else(|| {
            self.entries.push(ManagerEntry {
                manager: manager.to_owned(),
                operation,
                fields: BTreeSet::new(),
            });
            self.entries.len() - 1
        });
        &mut self.entries[position]
    }

    /// Every manager other than `keep` loses the fields whose value changed.
    fn release_changed(&mut self, before: &Value, keep: (&str, Operation)) {
        let after = &self.body;
        for entry in &mut self.entries {
            if entry.manager == keep.0 && entry.operation == keep.1 {
                continue;
            }
            entry
                .fields
                .retain(|path| path.resolve(before) == path.resolve(after));
        }
    }

    fn to_dynamic(&self) -> DynamicObject {
        let mut object = self.body.clone();
        let managed_fields: Vec<_> = self
            .entries
            .iter()
            .filter(|entry| !entry.fields.is_empty())
            .map(|entry| {
                let operation = match entry.operation {
                    Operation::Apply => "Apply",
                    Operation::Update => "Update",
                };
                json!({
                    "manager": entry.manager,
                    "operation": operation,
                    "apiVersion": object["apiVersion"],
                    "fieldsType": "FieldsV1",
                    "fieldsV1": FieldNode::from_paths(&entry.fields).to_fields_v1(),
                })
            })
            .collect();
        object["metadata"]["managedFields"] = Value::Array(managed_fields);
        object["metadata"]["resourceVersion"] = Value::String(self.resource_version.to_string());

        serde_json::from_value(object).expect("stored objects are valid objects")
    }
}

type ObjectKey = (String, Option<String>, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, StoredObject>,
    immutable: BTreeMap<String, Vec<FieldPath>>,
    persist_failure: Option<Rejection>,
    persisted_writes: usize,
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    state: Mutex<State>,
}

fn key(kind: &str, namespace: Option<&str>, name: &str) -> ObjectKey {
    let namespace = if CLUSTER_SCOPED_KINDS.contains(&kind) {
        None
    } else {
        Some(namespace.unwrap_or("default").to_owned())
    };
    (kind.to_owned(), namespace, name.to_owned())
}

fn target_key(target: &TargetRef) -> ObjectKey {
    key(&target.kind, target.namespace.as_deref(), &target.name)
}

/// The owned leaves of a document. Maps recurse, everything else is a leaf.
fn leaves(document: &Value) -> BTreeSet<FieldPath> {
    fn collect(value: &Value, path: FieldPath, leaves: &mut BTreeSet<FieldPath>) {
        match value {
            Value::Object(fields) if !fields.is_empty() => {
                for (name, child) in fields {
                    collect(child, path.child(PathSegment::field(name)), leaves);
                }
            }
            _ if path.is_root() => {}
            _ => {
                leaves.insert(path);
            }
        }
    }

    let mut leaves = BTreeSet::new();
    collect(document, FieldPath::root(), &mut leaves);
    leaves.retain(|path| {
        !UNOWNED_FIELDS
            .iter()
            .any(|fields| path.starts_with_fields(fields))
    });
    leaves
}

fn field_names(path: &FieldPath) -> impl Iterator<Item = &str> {
    path.segments().iter().map(|segment| match segment {
        PathSegment::Field(name) => name.as_str(),
        other => unreachable!("the memory store only tracks field paths, got {other:?}"),
    })
}

fn set_path(body: &mut Value, path: &FieldPath, value: Value) {
    let mut node = body;
    for name in field_names(path) {
        if !node.is_object() {
            *node = Value::Object(serde_json::Map::new());
        }
        node = node
            .as_object_mut()
            .expect("node was just turned into an object")
            .entry(name)
            .or_insert(Value::Null);
    }
    *node = value;
}

fn remove_path(body: &mut Value, path: &FieldPath) {
    let names: Vec<_> = field_names(path).collect();
    let Some((last, parents)) = names.split_last() else {
        return;
    };
    let mut node = body;
    for name in parents {
        let Some(child) = node.get_mut(*name) else {
            return;
        };
        node = child;
    }
    if let Some(fields) = node.as_object_mut() {
        fields.remove(*last);
    }
}

fn rejected(target: &TargetRef, rejection: Rejection) -> StoreError {
    StoreError::Rejected {
        target: target.to_string(),
        rejection,
    }
}

fn not_found(target: &TargetRef) -> StoreError {
    StoreError::NotFound {
        target: target.to_string(),
    }
}

impl MemoryStore {
    /// Makes the API server refuse changes to `fields` of every object of `kind`.
    pub(crate) fn with_immutable(self, kind: &str, fields: &[&[&str]]) -> Self {
        self.state.lock().expect("lock poisoned").immutable.insert(
            kind.to_owned(),
            fields
                .iter()
                .map(|fields| FieldPath::from_fields(fields.iter().copied()))
                .collect(),
        );
        self
    }

    /// Stores `object`, with all of its fields owned by `manager`.
    pub(crate) fn insert(&self, object: Value, manager: &str, operation: Operation) {
        let object_key = key(
            object["kind"].as_str().expect("object has a kind"),
            object["metadata"]["namespace"].as_str(),
            object["metadata"]["name"].as_str().expect("object has a name"),
        );
        let stored = StoredObject {
            entries: vec![ManagerEntry {
                manager: manager.to_owned(),
                operation,
                fields: leaves(&object),
            }],
            body: object,
            resource_version: 1,
        };
        self.state
            .lock()
            .expect("lock poisoned")
            .objects
            .insert(object_key, stored);
    }

    /// Merges `overlay` into the object like a non-apply write (`kubectl edit`) would.
    ///
    /// With `take_ownership` the writer becomes the owner of every changed field. Without, the
    /// values are overwritten while the managed fields stay untouched.
    pub(crate) fn update(
        &self,
        target: &TargetRef,
        overlay: &Value,
        manager: &str,
        take_ownership: bool,
    ) {
        let mut state = self.state.lock().expect("lock poisoned");
        let stored = state
            .objects
            .get_mut(&target_key(target))
            .expect("updated object exists");

        let before = stored.body.clone();
        deep_merge(&mut stored.body, overlay);
        if take_ownership {
            stored.release_changed(&before, (manager, Operation::Update));
            stored
                .entry_mut(manager, Operation::Update)
                .fields
                .extend(leaves(overlay));
        }
        stored.resource_version += 1;
    }

    /// Removes the object, like a deletion by another writer would.
    pub(crate) fn remove(&self, target: &TargetRef) {
        self.state
            .lock()
            .expect("lock poisoned")
            .objects
            .remove(&target_key(target));
    }

    /// Makes the next persisted (not dry run) write fail with `rejection`.
    pub(crate) fn fail_next_persisted_write(&self, rejection: Rejection) {
        self.state.lock().expect("lock poisoned").persist_failure = Some(rejection);
    }

    /// The number of persisted writes performed through [`ObjectStore`].
    pub(crate) fn persisted_writes(&self) -> usize {
        self.state.lock().expect("lock poisoned").persisted_writes
    }

    /// The stored object, without its managed fields.
    pub(crate) fn body(&self, target: &TargetRef) -> Option<Value> {
        self.state
            .lock()
            .expect("lock poisoned")
            .objects
            .get(&target_key(target))
            .map(|stored| stored.body.clone())
    }

    fn write(
        &self,
        target: &TargetRef,
        mode: WriteMode,
        change: impl FnOnce(&StoredObject, &[FieldPath]) -> Result<StoredObject, StoreError>,
    ) -> Result<DynamicObject, StoreError> {
        let mut state = self.state.lock().expect("lock poisoned");
        if !mode.is_dry_run()
            && let Some(rejection) = state.persist_failure.take()
        {
            return Err(rejected(target, rejection));
        }

        let object_key = target_key(target);
        let immutable = state.immutable.get(&target.kind).cloned().unwrap_or_default();
        let stored = state
            .objects
            .get(&object_key)
            .ok_or_else(|| not_found(target))?;

        let mut next = change(stored, &immutable)?;
        next.entries.retain(|entry| !entry.fields.is_empty());

        if mode.is_dry_run() {
            return Ok(next.to_dynamic());
        }

        next.resource_version += 1;
        let result = next.to_dynamic();
        state.objects.insert(object_key, next);
        state.persisted_writes += 1;
        Ok(result)
    }
}

fn check_immutable(
    target: &TargetRef,
    immutable: &[FieldPath],
    before: &Value,
    after: &Value,
) -> Result<(), StoreError> {
    let changed: Vec<_> = immutable
        .iter()
        .filter(|path| {
            let old = path.resolve(before);
            old.is_some() && old != path.resolve(after)
        })
        .map(ToString::to_string)
        .collect();
    if changed.is_empty() {
        Ok(())
    } else {
        Err(rejected(target, Rejection::ImmutableField { fields: changed }))
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, target: &TargetRef) -> Result<Option<DynamicObject>, StoreError> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state
            .objects
            .get(&target_key(target))
            .map(StoredObject::to_dynamic))
    }

    async fn apply(
        &self,
        target: &TargetRef,
        object: &Value,
        manager: &str,
        mode: WriteMode,
    ) -> Result<DynamicObject, StoreError> {
        self.write(target, mode, |stored, immutable| {
            let applied = leaves(object);
            let mut next = stored.clone();

            for leaf in &applied {
                if let Some(value) = leaf.resolve(object) {
                    set_path(&mut next.body, leaf, value.clone());
                }
            }
            check_immutable(target, immutable, &stored.body, &next.body)?;
            next.release_changed(&stored.body, (manager, Operation::Apply));

            let entry = next.entry_mut(manager, Operation::Apply);
            let previous = std::mem::replace(&mut entry.fields, applied.clone());

            // Fields dropped from the applied configuration are removed unless someone else
            // still owns them.
            for dropped in previous.difference(&applied) {
                if !next
                    .entries
                    .iter()
                    .any(|entry| entry.fields.contains(dropped))
                {
                    remove_path(&mut next.body, dropped);
                }
            }

            Ok(next)
        })
    }

    async fn patch(
        &self,
        target: &TargetRef,
        patch: StorePatch<'_>,
        manager: &str,
        mode: WriteMode,
    ) -> Result<DynamicObject, StoreError> {
        self.write(target, mode, |stored, immutable| {
            let mut next = stored.clone();
            match patch {
                StorePatch::Json(operations) => json_patch::patch(&mut next.body, &operations.0)
                    .map_err(|err| {
                        rejected(target, Rejection::Other {
                            code: 422,
                            reason: "Invalid".to_owned(),
                            message: err.to_string(),
                        })
                    })?,
                StorePatch::Merge(document) => json_patch::merge(&mut next.body, document),
            }
            check_immutable(target, immutable, &stored.body, &next.body)?;

            next.release_changed(&stored.body, (manager, Operation::Update));
            let changed: Vec<_> = leaves(&next.body)
                .into_iter()
                .filter(|path| path.resolve(&stored.body) != path.resolve(&next.body))
                .collect();
            next.entry_mut(manager, Operation::Update)
                .fields
                .extend(changed);

            Ok(next)
        })
    }
}
