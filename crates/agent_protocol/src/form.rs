//! Form extension wire shapes.
//!
//! These types cross into the agent's own protocol, so their JSON shape is
//! fixed: snake_case keys, fields tagged by `type`, response values encoded as
//! `{"type": ..., "value": ...}`.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::FormError;

const MIN_COLUMNS: u8 = 1;
const MAX_COLUMNS: u8 = 4;

/// Form the agent asks the user to fill before it can continue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormRender {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit_label: Option<String>,
    pub fields: Vec<FormField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FormField {
    Text(TextField),
    Date(DateField),
    File(FileField),
    #[serde(rename = "multiselect")]
    MultiSelect(MultiSelectField),
    Checkbox(CheckboxField),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextField {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col_span: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateField {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col_span: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileField {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col_span: Option<u8>,
    pub accept: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionItem {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiSelectField {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col_span: Option<u8>,
    pub options: Vec<OptionItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckboxField {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col_span: Option<u8>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<bool>,
}

/// Field discriminant shared by definitions and response values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Date,
    File,
    #[serde(rename = "multiselect")]
    MultiSelect,
    Checkbox,
}

impl FieldKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Date => "date",
            Self::File => "file",
            Self::MultiSelect => "multiselect",
            Self::Checkbox => "checkbox",
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FormField {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Text(field) => &field.id,
            Self::Date(field) => &field.id,
            Self::File(field) => &field.id,
            Self::MultiSelect(field) => &field.id,
            Self::Checkbox(field) => &field.id,
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Text(field) => &field.label,
            Self::Date(field) => &field.label,
            Self::File(field) => &field.label,
            Self::MultiSelect(field) => &field.label,
            Self::Checkbox(field) => &field.label,
        }
    }

    #[must_use]
    pub fn kind(&self) -> FieldKind {
        match self {
            Self::Text(_) => FieldKind::Text,
            Self::Date(_) => FieldKind::Date,
            Self::File(_) => FieldKind::File,
            Self::MultiSelect(_) => FieldKind::MultiSelect,
            Self::Checkbox(_) => FieldKind::Checkbox,
        }
    }

    #[must_use]
    pub fn is_required(&self) -> bool {
        let required = match self {
            Self::Text(field) => field.required,
            Self::Date(field) => field.required,
            Self::File(field) => field.required,
            Self::MultiSelect(field) => field.required,
            Self::Checkbox(field) => field.required,
        };
        required.unwrap_or(false)
    }

    #[must_use]
    pub fn col_span(&self) -> Option<u8> {
        match self {
            Self::Text(field) => field.col_span,
            Self::Date(field) => field.col_span,
            Self::File(field) => field.col_span,
            Self::MultiSelect(field) => field.col_span,
            Self::Checkbox(field) => field.col_span,
        }
    }

    /// Returns the value a fresh form should be pre-filled with, if any.
    #[must_use]
    pub fn default_value(&self) -> Option<FieldValue> {
        match self {
            Self::Text(field) => field.default_value.clone().map(FieldValue::Text),
            Self::Date(field) => field.default_value.clone().map(FieldValue::Date),
            Self::MultiSelect(field) => field.default_value.clone().map(FieldValue::MultiSelect),
            Self::Checkbox(field) => field.default_value.map(FieldValue::Checkbox),
            Self::File(_) => None,
        }
    }
}

impl FormRender {
    /// Checks the structural constraints a renderable form must satisfy.
    pub fn validate(&self) -> Result<(), FormError> {
        if self.id.trim().is_empty() {
            return Err(FormError::EmptyId);
        }

        if self.fields.is_empty() {
            return Err(FormError::EmptyFields {
                form_id: self.id.clone(),
            });
        }

        if let Some(columns) = self.columns {
            if !(MIN_COLUMNS..=MAX_COLUMNS).contains(&columns) {
                return Err(FormError::ColumnsOutOfRange {
                    form_id: self.id.clone(),
                    value: columns,
                });
            }
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.id()) {
                return Err(FormError::DuplicateFieldId {
                    field_id: field.id().to_string(),
                });
            }

            if let Some(col_span) = field.col_span() {
                if !(MIN_COLUMNS..=MAX_COLUMNS).contains(&col_span) {
                    return Err(FormError::ColSpanOutOfRange {
                        field_id: field.id().to_string(),
                        value: col_span,
                    });
                }
            }

            if let FormField::MultiSelect(multi) = field {
                if multi.options.is_empty() {
                    return Err(FormError::EmptyOptions {
                        field_id: multi.id.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn field(&self, field_id: &str) -> Option<&FormField> {
        self.fields.iter().find(|field| field.id() == field_id)
    }

    /// Returns pre-fill values keyed by field id. Fields without a default are absent.
    #[must_use]
    pub fn default_values(&self) -> BTreeMap<String, FieldValue> {
        self.fields
            .iter()
            .filter_map(|field| {
                field
                    .default_value()
                    .map(|value| (field.id().to_string(), value))
            })
            .collect()
    }
}

/// User answer to a [`FormRender`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormResponse {
    pub id: String,
    #[serde(default)]
    pub values: BTreeMap<String, FieldValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum FieldValue {
    Text(String),
    Date(String),
    File(Vec<FileValue>),
    #[serde(rename = "multiselect")]
    MultiSelect(Vec<String>),
    Checkbox(bool),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileValue {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl FieldValue {
    #[must_use]
    pub fn kind(&self) -> FieldKind {
        match self {
            Self::Text(_) => FieldKind::Text,
            Self::Date(_) => FieldKind::Date,
            Self::File(_) => FieldKind::File,
            Self::MultiSelect(_) => FieldKind::MultiSelect,
            Self::Checkbox(_) => FieldKind::Checkbox,
        }
    }
}

impl FormResponse {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            values: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_value(mut self, field_id: impl Into<String>, value: FieldValue) -> Self {
        self.values.insert(field_id.into(), value);
        self
    }

    /// Checks this response against the form it answers.
    ///
    /// Keys that name no field of `form` are dropped. A value whose type does
    /// not match its field, a multiselect choice outside the declared options,
    /// or a missing required field is rejected.
    pub fn sanitize_against(mut self, form: &FormRender) -> Result<Self, FormError> {
        if self.id != form.id {
            return Err(FormError::IdMismatch {
                expected: form.id.clone(),
                found: self.id,
            });
        }

        self.values.retain(|field_id, _| form.field(field_id).is_some());

        for field in &form.fields {
            let Some(value) = self.values.get(field.id()) else {
                if field.is_required() {
                    return Err(FormError::MissingRequired {
                        field_id: field.id().to_string(),
                    });
                }
                continue;
            };

            if value.kind() != field.kind() {
                return Err(FormError::ValueTypeMismatch {
                    field_id: field.id().to_string(),
                    expected: field.kind(),
                    found: value.kind(),
                });
            }

            if let (FormField::MultiSelect(multi), FieldValue::MultiSelect(selected)) =
                (field, value)
            {
                if let Some(unknown) = selected
                    .iter()
                    .find(|choice| !multi.options.iter().any(|option| &option.id == *choice))
                {
                    return Err(FormError::UnknownOption {
                        field_id: multi.id.clone(),
                        option: unknown.clone(),
                    });
                }
            }
        }

        Ok(self)
    }
}
