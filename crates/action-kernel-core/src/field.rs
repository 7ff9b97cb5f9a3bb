use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{EngineError, FieldId, RowId, TableId, WorkspaceId};

pub const MAX_DECIMAL_PLACES: u8 = 10;

/// Lowercased text values that convert to `true` for boolean fields.
pub const BOOLEAN_TRUE_VALUES: &[&str] = &["1", "t", "true", "y", "yes", "on", "checked"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Number,
    Boolean,
    SingleSelect,
    LinkRow,
}

impl FieldType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::SingleSelect => "single_select",
            Self::LinkRow => "link_row",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(Self::Text),
            "number" => Some(Self::Number),
            "boolean" => Some(Self::Boolean),
            "single_select" => Some(Self::SingleSelect),
            "link_row" => Some(Self::LinkRow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectOption {
    /// Assigned by the store; `None` for options that do not exist yet.
    #[serde(default)]
    pub id: Option<i64>,
    pub value: String,
    #[serde(default = "default_option_color")]
    pub color: String,
}

fn default_option_color() -> String {
    "blue".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldConfig {
    Text,
    Number {
        #[serde(default)]
        decimal_places: u8,
    },
    Boolean,
    SingleSelect {
        #[serde(default)]
        options: Vec<SelectOption>,
    },
    LinkRow {
        link_row_table_id: TableId,
        /// Filled in by the store once the reverse field exists.
        #[serde(default)]
        related_field_id: Option<FieldId>,
        /// Id of the relation table `rel_<id>`; filled in by the store.
        #[serde(default)]
        relation_id: Option<FieldId>,
    },
}

impl FieldConfig {
    #[must_use]
    pub fn field_type(&self) -> FieldType {
        match self {
            Self::Text => FieldType::Text,
            Self::Number { .. } => FieldType::Number,
            Self::Boolean => FieldType::Boolean,
            Self::SingleSelect { .. } => FieldType::SingleSelect,
            Self::LinkRow { .. } => FieldType::LinkRow,
        }
    }

    #[must_use]
    pub fn link_row(link_row_table_id: TableId) -> Self {
        Self::LinkRow { link_row_table_id, related_field_id: None, relation_id: None }
    }

    #[must_use]
    pub fn select_options(&self) -> &[SelectOption] {
        match self {
            Self::SingleSelect { options } => options,
            _ => &[],
        }
    }

    #[must_use]
    pub fn link_target(&self) -> Option<TableId> {
        match self {
            Self::LinkRow { link_row_table_id, .. } => Some(*link_row_table_id),
            _ => None,
        }
    }

    /// SQLite column type used for the field's cell storage. Link fields have no column.
    #[must_use]
    pub fn column_type(&self) -> Option<&'static str> {
        match self {
            Self::Text => Some("TEXT"),
            Self::Number { .. } => Some("REAL"),
            Self::Boolean | Self::SingleSelect { .. } => Some("INTEGER"),
            Self::LinkRow { .. } => None,
        }
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] for out of range decimal places or duplicate option ids.
    pub fn validate(&self) -> Result<(), EngineError> {
        match self {
            Self::Number { decimal_places } if *decimal_places > MAX_DECIMAL_PLACES => {
                Err(EngineError::Validation(format!(
                    "decimal_places MUST be between 0 and {MAX_DECIMAL_PLACES}"
                )))
            }
            Self::SingleSelect { options } => {
                let mut seen = Vec::new();
                for id in options.iter().filter_map(|option| option.id) {
                    if seen.contains(&id) {
                        return Err(EngineError::Validation(format!(
                            "select option id {id} appears more than once"
                        )));
                    }
                    seen.push(id);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn representation(&self) -> Representation<'_> {
        match self {
            Self::Text => Representation::Text,
            Self::Number { decimal_places } => Representation::Number(*decimal_places),
            Self::Boolean => Representation::Boolean,
            Self::SingleSelect { options } => Representation::Select(options),
            Self::LinkRow { link_row_table_id, .. } => Representation::Link(*link_row_table_id),
        }
    }
}

#[derive(PartialEq)]
enum Representation<'a> {
    Text,
    Number(u8),
    Boolean,
    Select(&'a [SelectOption]),
    Link(TableId),
}

/// Whether moving a field from `previous` to `next` changes how its cells are stored.
///
/// Renames never do. Any change of type, precision, option set or link target does.
#[must_use]
pub fn requires_backup(previous: &FieldConfig, next: &FieldConfig) -> bool {
    previous.representation() != next.representation()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Field {
    pub id: FieldId,
    pub table_id: TableId,
    pub name: String,
    pub position: i64,
    pub config: FieldConfig,
    pub trashed: bool,
}

impl Field {
    #[must_use]
    pub fn column_name(&self) -> String {
        format!("field_{}", self.id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FieldUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: Option<FieldConfig>,
}

impl FieldUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.config.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Table {
    pub id: TableId,
    pub workspace_id: WorkspaceId,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Row {
    pub id: RowId,
    pub values: BTreeMap<FieldId, CellValue>,
}

/// A single cell. Select cells hold the option id as a number; link cells hold row ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Boolean(bool),
    Number(f64),
    Text(String),
    Links(Vec<RowId>),
}

impl CellValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn option_id(&self) -> Option<i64> {
        match self {
            Self::Number(value) if value.is_finite() && value.fract() == 0.0 => Some(*value as i64),
            _ => None,
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_option_id(id: i64) -> Self {
        Self::Number(id as f64)
    }
}

/// Convert a cell stored under `from` into its value under `to`.
///
/// Values that have no meaning in the target representation become `Null`, except for
/// booleans which fall back to `false`.
#[must_use]
pub fn convert_cell(value: &CellValue, from: &FieldConfig, to: &FieldConfig) -> CellValue {
    let source = match from {
        FieldConfig::LinkRow { .. } => &CellValue::Null,
        _ => value,
    };

    match to {
        FieldConfig::LinkRow { .. } => CellValue::Null,
        FieldConfig::Text => text_form(source, from).map_or(CellValue::Null, CellValue::Text),
        FieldConfig::Number { decimal_places } => match (source, from) {
            (CellValue::Number(number), FieldConfig::Number { .. }) => {
                finite_number(*number, *decimal_places)
            }
            (CellValue::Boolean(flag), _) => CellValue::Number(if *flag { 1.0 } else { 0.0 }),
            _ => text_form(source, from)
                .and_then(|text| text.trim().parse::<f64>().ok())
                .map_or(CellValue::Null, |number| finite_number(number, *decimal_places)),
        },
        FieldConfig::Boolean => match (source, from) {
            (CellValue::Boolean(flag), _) => CellValue::Boolean(*flag),
            (CellValue::Number(number), FieldConfig::Number { .. }) => {
                CellValue::Boolean(*number != 0.0)
            }
            _ => CellValue::Boolean(text_form(source, from).is_some_and(|text| {
                BOOLEAN_TRUE_VALUES.contains(&text.trim().to_lowercase().as_str())
            })),
        },
        FieldConfig::SingleSelect { options } => {
            if let (FieldConfig::SingleSelect { .. }, Some(id)) = (from, source.option_id()) {
                if options.iter().any(|option| option.id == Some(id)) {
                    return CellValue::from_option_id(id);
                }
            }
            let Some(text) = text_form(source, from) else {
                return CellValue::Null;
            };
            let needle = text.trim();
            options
                .iter()
                .find(|option| option.value.trim().eq_ignore_ascii_case(needle))
                .and_then(|option| option.id)
                .map_or(CellValue::Null, CellValue::from_option_id)
        }
    }
}

fn text_form(value: &CellValue, from: &FieldConfig) -> Option<String> {
    match (value, from) {
        (CellValue::Null | CellValue::Links(_), _) => None,
        (CellValue::Text(text), _) => Some(text.clone()),
        (CellValue::Boolean(flag), _) => Some(flag.to_string()),
        (number @ CellValue::Number(_), FieldConfig::SingleSelect { options }) => {
            let id = number.option_id()?;
            options.iter().find(|option| option.id == Some(id)).map(|option| option.value.clone())
        }
        (CellValue::Number(number), FieldConfig::Number { decimal_places }) => {
            Some(format!("{number:.prec$}", prec = usize::from(*decimal_places)))
        }
        (CellValue::Number(number), _) => Some(number.to_string()),
    }
}

fn finite_number(value: f64, decimal_places: u8) -> CellValue {
    if !value.is_finite() {
        return CellValue::Null;
    }
    let factor = 10_f64.powi(i32::from(decimal_places));
    CellValue::Number((value * factor).round() / factor)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn option(id: i64, value: &str) -> SelectOption {
        SelectOption { id: Some(id), value: value.to_string(), color: "blue".to_string() }
    }

    fn select(options: Vec<SelectOption>) -> FieldConfig {
        FieldConfig::SingleSelect { options }
    }

    #[test]
    fn rename_only_never_requires_backup() {
        let text = FieldConfig::Text;
        assert!(!requires_backup(&text, &FieldConfig::Text));

        let link = FieldConfig::LinkRow {
            link_row_table_id: TableId(2),
            related_field_id: Some(FieldId(9)),
            relation_id: Some(FieldId(3)),
        };
        assert!(!requires_backup(&link, &FieldConfig::link_row(TableId(2))));
    }

    #[test]
    fn representation_changes_require_backup() {
        assert!(requires_backup(&FieldConfig::Text, &FieldConfig::Boolean));
        assert!(requires_backup(
            &FieldConfig::Number { decimal_places: 0 },
            &FieldConfig::Number { decimal_places: 2 }
        ));
        assert!(requires_backup(
            &select(vec![option(1, "a")]),
            &select(vec![option(1, "a"), SelectOption {
                id: None,
                value: "b".to_string(),
                color: "red".to_string(),
            }])
        ));
        assert!(requires_backup(
            &FieldConfig::link_row(TableId(2)),
            &FieldConfig::link_row(TableId(3))
        ));
    }

    #[test]
    fn config_json_uses_type_tag() -> Result<(), serde_json::Error> {
        let config: FieldConfig =
            serde_json::from_str(r#"{"type":"single_select","options":[{"value":"Open"}]}"#)?;
        assert_eq!(config.field_type(), FieldType::SingleSelect);
        assert_eq!(config.select_options()[0].color, "blue");
        assert_eq!(config.select_options()[0].id, None);

        let number: FieldConfig = serde_json::from_str(r#"{"type":"number"}"#)?;
        assert_eq!(number, FieldConfig::Number { decimal_places: 0 });
        Ok(())
    }

    #[test]
    fn validate_rejects_excess_precision_and_duplicate_option_ids() {
        assert!(FieldConfig::Number { decimal_places: 11 }.validate().is_err());
        assert!(select(vec![option(1, "a"), option(1, "b")]).validate().is_err());
        assert!(select(vec![option(1, "a"), option(2, "b")]).validate().is_ok());
    }

    #[test]
    fn text_to_number_parses_and_rounds() {
        let to = FieldConfig::Number { decimal_places: 1 };
        let converted = convert_cell(&CellValue::Text(" 3.14 ".to_string()), &FieldConfig::Text, &to);
        assert_eq!(converted, CellValue::Number(3.1));
        let garbage = convert_cell(&CellValue::Text("n/a".to_string()), &FieldConfig::Text, &to);
        assert_eq!(garbage, CellValue::Null);
    }

    #[test]
    fn number_to_text_respects_decimal_places() {
        let converted = convert_cell(
            &CellValue::Number(2.5),
            &FieldConfig::Number { decimal_places: 2 },
            &FieldConfig::Text,
        );
        assert_eq!(converted, CellValue::Text("2.50".to_string()));
    }

    #[test]
    fn text_to_boolean_accepts_known_truthy_tokens() {
        for token in ["yes", "TRUE", " 1 ", "checked", "on"] {
            assert_eq!(
                convert_cell(&CellValue::Text(token.to_string()), &FieldConfig::Text, &FieldConfig::Boolean),
                CellValue::Boolean(true),
                "{token}"
            );
        }
        assert_eq!(
            convert_cell(&CellValue::Text("nope".to_string()), &FieldConfig::Text, &FieldConfig::Boolean),
            CellValue::Boolean(false)
        );
        assert_eq!(
            convert_cell(&CellValue::Null, &FieldConfig::Text, &FieldConfig::Boolean),
            CellValue::Boolean(false)
        );
    }

    #[test]
    fn select_and_text_convert_through_option_values() {
        let from = select(vec![option(7, "Open"), option(8, "Closed")]);
        assert_eq!(
            convert_cell(&CellValue::from_option_id(8), &from, &FieldConfig::Text),
            CellValue::Text("Closed".to_string())
        );

        let to = select(vec![option(11, "open")]);
        assert_eq!(
            convert_cell(&CellValue::Text("Open".to_string()), &FieldConfig::Text, &to),
            CellValue::from_option_id(11)
        );
        assert_eq!(
            convert_cell(&CellValue::Text("Other".to_string()), &FieldConfig::Text, &to),
            CellValue::Null
        );
    }

    #[test]
    fn select_to_select_keeps_surviving_option_ids() {
        let from = select(vec![option(7, "Open"), option(8, "Closed")]);
        let to = select(vec![option(7, "Open")]);
        assert_eq!(convert_cell(&CellValue::from_option_id(7), &from, &to), CellValue::from_option_id(7));
        assert_eq!(convert_cell(&CellValue::from_option_id(8), &from, &to), CellValue::Null);
    }

    #[test]
    fn link_cells_do_not_survive_conversion() {
        let link = FieldConfig::link_row(TableId(4));
        let cell = CellValue::Links(vec![RowId(1), RowId(2)]);
        assert_eq!(convert_cell(&cell, &link, &FieldConfig::Text), CellValue::Null);
        assert_eq!(convert_cell(&cell, &link, &FieldConfig::Boolean), CellValue::Boolean(false));
        assert_eq!(
            convert_cell(&CellValue::Text("x".to_string()), &FieldConfig::Text, &link),
            CellValue::Null
        );
    }

    #[test]
    fn cell_values_deserialize_untagged() -> Result<(), serde_json::Error> {
        let cells: Vec<CellValue> = serde_json::from_str(r#"[null, true, 2.5, "x", [1, 2]]"#)?;
        assert_eq!(
            cells,
            vec![
                CellValue::Null,
                CellValue::Boolean(true),
                CellValue::Number(2.5),
                CellValue::Text("x".to_string()),
                CellValue::Links(vec![RowId(1), RowId(2)]),
            ]
        );
        Ok(())
    }

    proptest! {
        #[test]
        fn property_text_to_text_is_identity(text in ".{0,40}") {
            let cell = CellValue::Text(text);
            prop_assert_eq!(convert_cell(&cell, &FieldConfig::Text, &FieldConfig::Text), cell);
        }

        #[test]
        fn property_number_conversion_never_yields_more_precision(
            value in -1.0e6_f64..1.0e6,
            places in 0_u8..=4,
        ) {
            let to = FieldConfig::Number { decimal_places: places };
            let converted = convert_cell(&CellValue::Number(value), &FieldConfig::Number { decimal_places: 10 }, &to);
            let CellValue::Number(rounded) = converted else {
                panic!("finite number must stay a number");
            };
            let again = convert_cell(&CellValue::Number(rounded), &to, &to);
            prop_assert_eq!(again, CellValue::Number(rounded));
        }
    }
}
