//! Search filter trees.
//!
//! A provider describes its search form as a [`FilterTree`]. The tree is what users edit; the
//! provider's `search` receives the reduced value map from [`FilterTree::values`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckState {
    Checked,
    #[default]
    Unchecked,
    Indeterminate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckboxValues {
    pub checked: Value,
    #[serde(default)]
    pub indeterminate: Option<Value>,
    #[serde(default)]
    pub unchecked: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Filter {
    #[serde(rename_all = "camelCase")]
    Checkbox {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default)]
        allow_indeterminate: bool,
        #[serde(default)]
        checked: Option<CheckState>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checkbox_values: Option<CheckboxValues>,
    },
    #[serde(rename_all = "camelCase")]
    Select {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default)]
        allow_multiple: bool,
        #[serde(default)]
        selected: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    Date {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default)]
        min_date: Option<String>,
        #[serde(default)]
        max_date: Option<String>,
        #[serde(default)]
        selected_date: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Text {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default)]
        placeholder_value: Option<String>,
        #[serde(default)]
        value: Option<String>,
    },
    Group {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        fields: Vec<Field>,
    },
    Readonly {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        fields: Vec<Field>,
    },
}

/// A member of a group filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub id: String,
    #[serde(flatten)]
    pub filter: Filter,
}

impl Filter {
    pub fn name(&self) -> Option<&str> {
        match self {
            Filter::Checkbox { name, .. }
            | Filter::Select { name, .. }
            | Filter::Date { name, .. }
            | Filter::Text { name, .. }
            | Filter::Group { name, .. }
            | Filter::Readonly { name, .. } => name.as_deref(),
        }
    }

    /// The value a provider sees for this filter.
    pub fn value(&self) -> Value {
        match self {
            Filter::Group { fields, .. } | Filter::Readonly { fields, .. } => {
                let mut out = Map::new();
                for field in fields {
                    out.insert(field.id.clone(), field.filter.value());
                }
                Value::Object(out)
            }
            Filter::Checkbox { allow_indeterminate, checked, checkbox_values, .. } => {
                checkbox_value(*allow_indeterminate, checked.unwrap_or_default(), checkbox_values.as_ref())
            }
            Filter::Select { selected, .. } => selected.clone().unwrap_or(Value::Null),
            Filter::Date { selected_date, .. } => opt_string(selected_date),
            Filter::Text { value, .. } => opt_string(value),
        }
    }
}

fn opt_string(v: &Option<String>) -> Value {
    v.as_ref().map(|s| Value::String(s.clone())).unwrap_or(Value::Null)
}

fn checkbox_value(allow_indeterminate: bool, state: CheckState, custom: Option<&CheckboxValues>) -> Value {
    // An indeterminate state is only meaningful when the checkbox allows it.
    let state = match state {
        CheckState::Indeterminate if !allow_indeterminate => CheckState::Unchecked,
        s => s,
    };
    if let Some(values) = custom {
        return match state {
            CheckState::Checked => values.checked.clone(),
            CheckState::Indeterminate => values.indeterminate.clone().unwrap_or(Value::from(0)),
            CheckState::Unchecked => values
                .unchecked
                .clone()
                .unwrap_or(Value::from(if allow_indeterminate { -1 } else { 0 })),
        };
    }
    match (state, allow_indeterminate) {
        (CheckState::Checked, _) => Value::from(1),
        (CheckState::Indeterminate, _) => Value::from(0),
        (CheckState::Unchecked, true) => Value::from(-1),
        (CheckState::Unchecked, false) => Value::from(0),
    }
}

/// A provider's whole search form, keyed by top-level filter id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct FilterTree(pub BTreeMap<String, Filter>);

impl FilterTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        if json.trim().is_empty() {
            return Ok(Self::new());
        }
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> String {
        // A tree of strings, numbers and maps always serializes.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn insert(&mut self, id: impl Into<String>, filter: Filter) -> Option<Filter> {
        self.0.insert(id.into(), filter)
    }

    pub fn get(&self, id: &str) -> Option<&Filter> {
        self.0.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Filter> {
        self.0.get_mut(id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Reduce the tree to the plain value map handed to `search`.
    pub fn values(&self) -> Value {
        let mut out = Map::new();
        for (id, filter) in &self.0 {
            out.insert(id.clone(), filter.value());
        }
        Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree() -> FilterTree {
        FilterTree::from_json(
            r#"{
                "safe": { "type": "checkbox", "allowIndeterminate": false, "checked": "checked" },
                "tags": {
                    "type": "group",
                    "name": "Tags",
                    "fields": [
                        { "id": "action", "type": "checkbox", "allowIndeterminate": true, "checked": "unchecked" },
                        { "id": "romance", "type": "checkbox", "allowIndeterminate": true, "checked": "indeterminate" }
                    ]
                },
                "order": { "type": "select", "selected": "latest" },
                "author": { "type": "text", "placeholderValue": "Author" }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn values_reduce_nested_groups() {
        assert_eq!(
            tree().values(),
            json!({
                "safe": 1,
                "tags": { "action": -1, "romance": 0 },
                "order": "latest",
                "author": null,
            })
        );
    }

    #[test]
    fn custom_checkbox_values_win() {
        let f = Filter::Checkbox {
            name: None,
            allow_indeterminate: false,
            checked: Some(CheckState::Checked),
            checkbox_values: Some(CheckboxValues { checked: json!("yes"), indeterminate: None, unchecked: Some(json!("no")) }),
        };
        assert_eq!(f.value(), json!("yes"));
    }

    #[test]
    fn indeterminate_without_permission_reads_unchecked() {
        let f = Filter::Checkbox { name: None, allow_indeterminate: false, checked: Some(CheckState::Indeterminate), checkbox_values: None };
        assert_eq!(f.value(), json!(0));
    }

    #[test]
    fn json_round_trip_keeps_camel_case() {
        let t = tree();
        let json = t.to_json();
        assert!(json.contains("allowIndeterminate"));
        assert_eq!(FilterTree::from_json(&json).unwrap(), t);
    }

    #[test]
    fn empty_json_is_empty_tree() {
        assert!(FilterTree::from_json("").unwrap().is_empty());
    }
}
