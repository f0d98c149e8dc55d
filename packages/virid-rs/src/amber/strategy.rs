//! Backup strategies - how one component type is captured, compared and restored.
//!
//! Every hook is optional; unset ones fall back to the structural defaults in
//! [`snapshot`](super::snapshot) over the component's serde representation.
//!
//! ```ignore
//! amber.backup_with::<Document>(
//!     BackupStrategy::new()
//!         .diff_with(|old, doc| Ok(old["revision"] != doc.revision))
//!         .on_restore(|_, new, direction| {
//!             debug!(?direction, revision = %new["revision"], "document restored");
//!         }),
//! )?;
//! ```

use std::fmt;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::component::{Component, ComponentKey};
use crate::error::HistoryError;

use super::snapshot;

/// Which way a restore moved through history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreDirection {
    Undo,
    Redo,
}

type SerializeFn<T> = dyn Fn(&T) -> anyhow::Result<Value>;
type DeserializeFn<T> = dyn Fn(&mut T, &Value) -> anyhow::Result<()>;
type DiffFn<T> = dyn Fn(&Value, &T) -> anyhow::Result<bool>;
type BackupHookFn = dyn Fn(&Value);
type RestoreHookFn = dyn Fn(&Value, &Value, RestoreDirection);

/// Per-type overrides for the version store.
pub struct BackupStrategy<T> {
    serialize: Option<Rc<SerializeFn<T>>>,
    deserialize: Option<Rc<DeserializeFn<T>>>,
    diff: Option<Rc<DiffFn<T>>>,
    on_before_backup: Option<Rc<BackupHookFn>>,
    on_after_backup: Option<Rc<BackupHookFn>>,
    on_restore: Option<Rc<RestoreHookFn>>,
}

impl<T> BackupStrategy<T> {
    pub fn new() -> Self {
        Self {
            serialize: None,
            deserialize: None,
            diff: None,
            on_before_backup: None,
            on_after_backup: None,
            on_restore: None,
        }
    }

    /// Produce the snapshot of the live instance.
    pub fn serialize_with(mut self, f: impl Fn(&T) -> anyhow::Result<Value> + 'static) -> Self {
        self.serialize = Some(Rc::new(f));
        self
    }

    /// Write a snapshot back into the live instance.
    pub fn deserialize_with(
        mut self,
        f: impl Fn(&mut T, &Value) -> anyhow::Result<()> + 'static,
    ) -> Self {
        self.deserialize = Some(Rc::new(f));
        self
    }

    /// Decide whether the live instance moved away from the last snapshot.
    pub fn diff_with(mut self, f: impl Fn(&Value, &T) -> anyhow::Result<bool> + 'static) -> Self {
        self.diff = Some(Rc::new(f));
        self
    }

    /// Called with the outgoing snapshot right before a new one is stored.
    pub fn on_before_backup(mut self, f: impl Fn(&Value) + 'static) -> Self {
        self.on_before_backup = Some(Rc::new(f));
        self
    }

    /// Called with the new snapshot once it is stored.
    pub fn on_after_backup(mut self, f: impl Fn(&Value) + 'static) -> Self {
        self.on_after_backup = Some(Rc::new(f));
        self
    }

    /// Called with `(old, new, direction)` after the instance was restored.
    pub fn on_restore(mut self, f: impl Fn(&Value, &Value, RestoreDirection) + 'static) -> Self {
        self.on_restore = Some(Rc::new(f));
        self
    }
}

impl<T> Default for BackupStrategy<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BackupStrategy<T> {
    fn clone(&self) -> Self {
        Self {
            serialize: self.serialize.clone(),
            deserialize: self.deserialize.clone(),
            diff: self.diff.clone(),
            on_before_backup: self.on_before_backup.clone(),
            on_after_backup: self.on_after_backup.clone(),
            on_restore: self.on_restore.clone(),
        }
    }
}

impl<T> fmt::Debug for BackupStrategy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupStrategy")
            .field("serialize", &self.serialize.is_some())
            .field("deserialize", &self.deserialize.is_some())
            .field("diff", &self.diff.is_some())
            .field("on_before_backup", &self.on_before_backup.is_some())
            .field("on_after_backup", &self.on_after_backup.is_some())
            .field("on_restore", &self.on_restore.is_some())
            .finish()
    }
}

// =============================================================================
// Tracked Entities
// =============================================================================

/// A live component under version control, with its type erased.
pub(crate) trait Tracked {
    fn key(&self) -> ComponentKey;

    fn serialize(&self) -> Result<Value, HistoryError>;

    fn deserialize(&self, snapshot: &Value) -> Result<(), HistoryError>;

    /// Whether the live instance differs from `old`.
    fn diff(&self, old: &Value) -> Result<bool, HistoryError>;

    fn before_backup(&self, old: &Value);

    fn after_backup(&self, new: &Value);

    fn on_restore(&self, old: &Value, new: &Value, direction: RestoreDirection);
}

/// Depth bounds for the default snapshot functions.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Depths {
    pub snapshot: usize,
    pub diff: usize,
}

pub(crate) struct TrackedComponent<T> {
    component: Component<T>,
    strategy: BackupStrategy<T>,
    depths: Depths,
}

impl<T> TrackedComponent<T> {
    pub fn new(component: Component<T>, strategy: BackupStrategy<T>, depths: Depths) -> Self {
        Self {
            component,
            strategy,
            depths,
        }
    }
}

impl<T> TrackedComponent<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn name(&self) -> &'static str {
        self.component.key().name()
    }

    fn live_value(&self, live: &T) -> anyhow::Result<Value> {
        Ok(serde_json::to_value(live)?)
    }

    fn busy(&self) -> anyhow::Error {
        anyhow::anyhow!("component {} is borrowed elsewhere", self.name())
    }
}

impl<T> Tracked for TrackedComponent<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn key(&self) -> ComponentKey {
        self.component.key()
    }

    fn serialize(&self) -> Result<Value, HistoryError> {
        let result = self
            .component
            .try_borrow()
            .map_err(|_| self.busy())
            .and_then(|live| match &self.strategy.serialize {
                Some(serialize) => serialize(&*live),
                None => Ok(snapshot::capture(
                    &self.live_value(&*live)?,
                    self.depths.snapshot,
                )),
            });

        result.map_err(|source| HistoryError::Serialize {
            component: self.name(),
            source,
        })
    }

    fn deserialize(&self, snapshot: &Value) -> Result<(), HistoryError> {
        let result = self
            .component
            .try_borrow_mut()
            .map_err(|_| self.busy())
            .and_then(|mut live| match &self.strategy.deserialize {
                Some(deserialize) => deserialize(&mut *live, snapshot),
                None => {
                    let mut merged = self.live_value(&*live)?;
                    snapshot::merge(&mut merged, snapshot);
                    *live = serde_json::from_value(merged)?;
                    Ok(())
                }
            });

        result.map_err(|source| HistoryError::Deserialize {
            component: self.name(),
            source,
        })
    }

    fn diff(&self, old: &Value) -> Result<bool, HistoryError> {
        let result = self
            .component
            .try_borrow()
            .map_err(|_| self.busy())
            .and_then(|live| match &self.strategy.diff {
                Some(diff) => diff(old, &*live),
                None => Ok(snapshot::diff(
                    old,
                    &self.live_value(&*live)?,
                    self.depths.diff,
                )),
            });

        result.map_err(|source| HistoryError::Diff {
            component: self.name(),
            source,
        })
    }

    fn before_backup(&self, old: &Value) {
        if let Some(hook) = &self.strategy.on_before_backup {
            hook(old);
        }
    }

    fn after_backup(&self, new: &Value) {
        if let Some(hook) = &self.strategy.on_after_backup {
            hook(new);
        }
    }

    fn on_restore(&self, old: &Value, new: &Value, direction: RestoreDirection) {
        if let Some(hook) = &self.strategy.on_restore {
            hook(old, new, direction);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Editor {
        text: String,
        cursor: usize,
        #[serde(default)]
        _undo_hint: u32,
    }

    fn tracked(strategy: BackupStrategy<Editor>) -> (Component<Editor>, TrackedComponent<Editor>) {
        let component = Component::new(Editor {
            text: "hello".into(),
            cursor: 5,
            _undo_hint: 1,
        });
        let tracked = TrackedComponent::new(
            component.clone(),
            strategy,
            Depths {
                snapshot: 5,
                diff: 5,
            },
        );
        (component, tracked)
    }

    #[test]
    fn default_serialize_skips_private_fields() {
        let (_, tracked) = tracked(BackupStrategy::new());

        let snapshot = tracked.serialize().unwrap();

        assert_eq!(snapshot, json!({ "text": "hello", "cursor": 5 }));
    }

    #[test]
    fn default_deserialize_keeps_private_fields() {
        let (component, tracked) = tracked(BackupStrategy::new());
        component.update(|e| e._undo_hint = 42);

        tracked
            .deserialize(&json!({ "text": "bye", "cursor": 0 }))
            .unwrap();

        assert_eq!(
            *component.borrow(),
            Editor {
                text: "bye".into(),
                cursor: 0,
                _undo_hint: 42,
            }
        );
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Caret {
        line: u32,
        column: u32,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Workspace {
        files: BTreeMap<String, i64>,
        caret: Caret,
        tags: Vec<String>,
        #[serde(default)]
        _scratch: u32,
    }

    #[test]
    fn default_round_trip_restores_added_removed_and_nested_fields() {
        for snapshot_depth in [1, 5] {
            let original = Workspace {
                files: BTreeMap::from([("a.rs".to_string(), 1), ("b.rs".to_string(), 2)]),
                caret: Caret { line: 3, column: 7 },
                tags: vec!["draft".to_string()],
                _scratch: 0,
            };
            let component = Component::new(original.clone());
            let tracked = TrackedComponent::new(
                component.clone(),
                BackupStrategy::new(),
                Depths {
                    snapshot: snapshot_depth,
                    diff: 5,
                },
            );
            let snapshot = tracked.serialize().unwrap();

            component.update(|w| {
                w.files.remove("a.rs");
                w.files.insert("c.rs".to_string(), 3);
                w.caret.line = 40;
                w.tags.push("review".to_string());
                w._scratch = 11;
            });
            assert!(tracked.diff(&snapshot).unwrap());

            tracked.deserialize(&snapshot).unwrap();

            let restored = component.borrow().clone();
            assert_eq!(
                restored,
                Workspace {
                    _scratch: 11,
                    ..original.clone()
                },
                "snapshot depth {snapshot_depth}"
            );
            assert!(!tracked.diff(&snapshot).unwrap());
        }
    }

    #[test]
    fn default_diff_tracks_public_fields_only() {
        let (component, tracked) = tracked(BackupStrategy::new());
        let snapshot = tracked.serialize().unwrap();

        component.update(|e| e._undo_hint = 9);
        assert!(!tracked.diff(&snapshot).unwrap());

        component.update(|e| e.cursor = 1);
        assert!(tracked.diff(&snapshot).unwrap());
    }

    #[test]
    fn custom_functions_replace_defaults() {
        let strategy = BackupStrategy::new()
            .serialize_with(|e: &Editor| Ok(json!(e.text)))
            .deserialize_with(|e: &mut Editor, v: &Value| {
                e.text = v.as_str().unwrap_or_default().to_string();
                Ok(())
            })
            .diff_with(|old: &Value, e: &Editor| Ok(old.as_str() != Some(e.text.as_str())));
        let (component, tracked) = tracked(strategy);

        let snapshot = tracked.serialize().unwrap();
        component.update(|e| e.cursor = 0);

        assert_eq!(snapshot, json!("hello"));
        assert!(!tracked.diff(&snapshot).unwrap());

        tracked.deserialize(&json!("restored")).unwrap();
        assert_eq!(component.borrow().text, "restored");
    }

    #[test]
    fn failures_name_the_component() {
        let strategy =
            BackupStrategy::new().serialize_with(|_: &Editor| anyhow::bail!("not today"));
        let (_, tracked) = tracked(strategy);

        let err = tracked.serialize().unwrap_err();

        assert!(matches!(err, HistoryError::Serialize { .. }));
        assert!(err.to_string().contains("Editor"));
    }

    #[test]
    fn busy_component_fails_instead_of_panicking() {
        let (component, tracked) = tracked(BackupStrategy::new());
        let _guard = component.borrow_mut();

        assert!(matches!(
            tracked.serialize(),
            Err(HistoryError::Serialize { .. })
        ));
    }

    #[test]
    fn hooks_fire_when_set() {
        let calls = std::rc::Rc::new(RefCell::new(Vec::new()));
        let (before, after, restore) = (calls.clone(), calls.clone(), calls.clone());
        let strategy = BackupStrategy::<Editor>::new()
            .on_before_backup(move |_| before.borrow_mut().push("before".to_string()))
            .on_after_backup(move |_| after.borrow_mut().push("after".to_string()))
            .on_restore(move |_, _, direction| {
                restore.borrow_mut().push(format!("restore:{direction:?}"))
            });
        let (_, tracked) = tracked(strategy);
        let value = json!({});

        tracked.before_backup(&value);
        tracked.after_backup(&value);
        tracked.on_restore(&value, &value, RestoreDirection::Undo);

        assert_eq!(*calls.borrow(), vec!["before", "after", "restore:Undo"]);
    }
}
