//! Field-group merge policy for version conflicts.
//!
//! Each entity type declares which of its fields form independently mergeable
//! groups. Fields not listed belong to one implicit `other` group. Given the
//! last confirmed payload (the base), the local payload and the current remote
//! payload:
//!
//! - groups changed on one side only take that side's values;
//! - a group changed on both sides goes to the remote, dropping the local edits
//!   in it, unless the same field was changed to different values on both
//!   sides, which cannot be resolved automatically.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::models::Payload;

/// Name of the group holding fields not declared in any group.
pub const OTHER_GROUP: &str = "other";

/// Named set of fields merged as one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldGroup {
    pub name: String,
    pub fields: Vec<String>,
}

impl FieldGroup {
    pub fn new(name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            name: name.into(),
            fields: fields.iter().map(|field| (*field).to_string()).collect(),
        }
    }
}

/// Result of a three-way field-group merge.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// Merged payload plus the groups where local edits were dropped
    Merged {
        payload: Payload,
        dropped_groups: Vec<String>,
    },
    /// Fields changed to different values on both sides
    Conflict { fields: Vec<String> },
}

/// Per-entity-type field group table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeTable {
    /// entity type -> field -> group name
    groups: HashMap<String, HashMap<String, String>>,
}

impl MergeTable {
    /// Empty table: every field of every type is in the `other` group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Groups for the built-in field maintenance entity types.
    pub fn with_defaults() -> Self {
        Self::new()
            .with_groups(
                "equipment",
                vec![
                    FieldGroup::new(
                        "identity",
                        &["name", "serial_number", "manufacturer", "model", "location"],
                    ),
                    FieldGroup::new("status", &["status", "condition", "last_inspected_at"]),
                    FieldGroup::new("notes", &["notes"]),
                ],
            )
            .with_groups(
                "panel_configuration",
                vec![
                    FieldGroup::new("layout", &["rows", "columns", "voltage", "main_breaker"]),
                    FieldGroup::new("circuits", &["circuits"]),
                    FieldGroup::new("labels", &["labels", "label_notes"]),
                ],
            )
            .with_groups(
                "maintenance_session",
                vec![
                    FieldGroup::new(
                        "schedule",
                        &["scheduled_for", "technician_id", "duration_minutes"],
                    ),
                    FieldGroup::new("status", &["status", "completed_at"]),
                    FieldGroup::new("findings", &["findings", "checklist", "notes"]),
                ],
            )
    }

    /// Replace the group declaration for one entity type.
    #[must_use]
    pub fn with_groups(mut self, entity_type: impl Into<String>, groups: Vec<FieldGroup>) -> Self {
        let mut by_field = HashMap::new();
        for group in groups {
            for field in group.fields {
                by_field.insert(field, group.name.clone());
            }
        }
        self.groups.insert(entity_type.into(), by_field);
        self
    }

    /// Apply overrides shaped `{ entity_type: { group: [fields] } }`.
    #[must_use]
    pub fn with_overrides(
        mut self,
        overrides: &BTreeMap<String, BTreeMap<String, Vec<String>>>,
    ) -> Self {
        for (entity_type, groups) in overrides {
            let groups = groups
                .iter()
                .map(|(name, fields)| FieldGroup {
                    name: name.clone(),
                    fields: fields.clone(),
                })
                .collect();
            self = self.with_groups(entity_type.clone(), groups);
        }
        self
    }

    /// Group a field belongs to for the given entity type.
    pub fn group_of<'a>(&'a self, entity_type: &str, field: &str) -> &'a str {
        self.groups
            .get(entity_type)
            .and_then(|fields| fields.get(field))
            .map_or(OTHER_GROUP, String::as_str)
    }

    /// Three-way merge of `local` and `remote` against their common `base`.
    pub fn merge(
        &self,
        entity_type: &str,
        base: Option<&Payload>,
        local: &Payload,
        remote: &Payload,
    ) -> MergeOutcome {
        let empty = Payload::new();
        let base = base.unwrap_or(&empty);
        let local_changes = changed_fields(base, local);
        let remote_changes = changed_fields(base, remote);

        let remote_groups: BTreeSet<&str> = remote_changes
            .iter()
            .map(|field| self.group_of(entity_type, field))
            .collect();

        let conflicting: Vec<String> = local_changes
            .intersection(&remote_changes)
            .filter(|field| local.get(field.as_str()) != remote.get(field.as_str()))
            .cloned()
            .collect();
        if !conflicting.is_empty() {
            return MergeOutcome::Conflict {
                fields: conflicting,
            };
        }

        let mut payload = remote.clone();
        let mut dropped = BTreeSet::new();
        for field in &local_changes {
            let group = self.group_of(entity_type, field);
            if remote_groups.contains(group) {
                dropped.insert(group.to_string());
                continue;
            }
            match local.get(field) {
                Some(value) => {
                    payload.insert(field.clone(), value.clone());
                }
                None => {
                    payload.remove(field);
                }
            }
        }

        MergeOutcome::Merged {
            payload,
            dropped_groups: dropped.into_iter().collect(),
        }
    }
}

/// Fields whose value differs between `base` and `other`, including additions
/// and removals.
fn changed_fields(base: &Payload, other: &Payload) -> BTreeSet<String> {
    base.keys()
        .chain(other.keys())
        .filter(|field| base.get(field.as_str()) != other.get(field.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn base() -> Payload {
        payload(json!({
            "name": "Chiller 2",
            "status": "ok",
            "condition": "good",
            "notes": "",
        }))
    }

    #[test]
    fn disjoint_groups_are_unioned() {
        let table = MergeTable::with_defaults();
        let local = payload(json!({
            "name": "Chiller 2",
            "status": "ok",
            "condition": "good",
            "notes": "belt worn",
        }));
        let remote = payload(json!({
            "name": "Chiller 2",
            "status": "down",
            "condition": "poor",
            "notes": "",
        }));

        let outcome = table.merge("equipment", Some(&base()), &local, &remote);
        assert_eq!(
            outcome,
            MergeOutcome::Merged {
                payload: payload(json!({
                    "name": "Chiller 2",
                    "status": "down",
                    "condition": "poor",
                    "notes": "belt worn",
                })),
                dropped_groups: vec![],
            }
        );
    }

    #[test]
    fn same_group_different_fields_goes_to_remote() {
        let table = MergeTable::with_defaults();
        let local = payload(json!({
            "name": "Chiller 2",
            "status": "ok",
            "condition": "fair",
            "notes": "checked",
        }));
        let remote = payload(json!({
            "name": "Chiller 2",
            "status": "down",
            "condition": "good",
            "notes": "",
        }));

        let MergeOutcome::Merged {
            payload: merged,
            dropped_groups,
        } = table.merge("equipment", Some(&base()), &local, &remote)
        else {
            panic!("expected merge");
        };
        assert_eq!(merged["status"], json!("down"));
        assert_eq!(merged["condition"], json!("good"));
        assert_eq!(merged["notes"], json!("checked"));
        assert_eq!(dropped_groups, vec!["status".to_string()]);
    }

    #[test]
    fn same_field_changed_differently_conflicts() {
        let table = MergeTable::with_defaults();
        let mut local = base();
        local.insert("status".to_string(), json!("needs-repair"));
        let mut remote = base();
        remote.insert("status".to_string(), json!("retired"));

        assert_eq!(
            table.merge("equipment", Some(&base()), &local, &remote),
            MergeOutcome::Conflict {
                fields: vec!["status".to_string()],
            }
        );
    }

    #[test]
    fn identical_edits_on_both_sides_merge_cleanly() {
        let table = MergeTable::with_defaults();
        let mut local = base();
        local.insert("status".to_string(), json!("down"));
        let remote = local.clone();

        let outcome = table.merge("equipment", Some(&base()), &local, &remote);
        assert!(matches!(outcome, MergeOutcome::Merged { ref payload, .. } if *payload == remote));
    }

    #[test]
    fn undeclared_fields_share_the_other_group() {
        let table = MergeTable::with_defaults();
        assert_eq!(table.group_of("equipment", "warranty"), OTHER_GROUP);
        assert_eq!(table.group_of("unknown_type", "status"), OTHER_GROUP);

        let base = payload(json!({"warranty": "2027", "asset_tag": "A1"}));
        let local = payload(json!({"warranty": "2028", "asset_tag": "A1"}));
        let remote = payload(json!({"warranty": "2027", "asset_tag": "A2"}));
        let MergeOutcome::Merged {
            payload: merged,
            dropped_groups,
        } = table.merge("equipment", Some(&base), &local, &remote)
        else {
            panic!("expected merge");
        };
        assert_eq!(merged["warranty"], json!("2027"));
        assert_eq!(dropped_groups, vec![OTHER_GROUP.to_string()]);
    }

    #[test]
    fn local_field_removal_survives_merge() {
        let table = MergeTable::with_defaults();
        let local = payload(json!({"name": "Chiller 2", "status": "ok", "condition": "good"}));
        let mut remote = base();
        remote.insert("status".to_string(), json!("down"));

        let MergeOutcome::Merged { payload: merged, .. } =
            table.merge("equipment", Some(&base()), &local, &remote)
        else {
            panic!("expected merge");
        };
        assert!(!merged.contains_key("notes"));
        assert_eq!(merged["status"], json!("down"));
    }

    #[test]
    fn overrides_replace_the_type_table() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "equipment".to_string(),
            BTreeMap::from([("everything".to_string(), vec!["status".to_string()])]),
        );
        let table = MergeTable::with_defaults().with_overrides(&overrides);
        assert_eq!(table.group_of("equipment", "status"), "everything");
        assert_eq!(table.group_of("equipment", "name"), OTHER_GROUP);
        assert_eq!(table.group_of("panel_configuration", "circuits"), "circuits");
    }
}
