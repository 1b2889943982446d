use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{NavuError, Result};

/// A single result row: column name to raw JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Entry in the `/entities` metadata catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct EntityInfo {
    pub id: Option<String>,
    #[serde(rename = "entityId")]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldInfo>,
}

impl EntityInfo {
    /// Whether this catalog entry answers to `name` (by `id` or `entityId`).
    pub fn matches(&self, name: &str) -> bool {
        self.id.as_deref() == Some(name) || self.entity_id.as_deref() == Some(name)
    }

    /// Column names in declaration order, skipping fields without one.
    pub fn column_names(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter_map(|f| f.column_name.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldInfo {
    #[serde(rename = "columnName")]
    pub column_name: Option<String>,
}

/// Body of a `runquery` request.
#[derive(Debug, Clone, Serialize)]
pub struct QueryRequest {
    #[serde(rename = "topCount", skip_serializing_if = "Option::is_none")]
    pub top_count: Option<u32>,
    #[serde(rename = "rootEntity")]
    pub root_entity: RootEntity,
    pub query: QueryClause,
    #[serde(rename = "displayFields")]
    pub display_fields: Vec<DisplayField>,
}

impl QueryRequest {
    /// Build a request selecting `columns` from `entity`, in order.
    pub fn new(entity: &str, columns: &[String]) -> Self {
        Self {
            top_count: None,
            root_entity: RootEntity {
                id: entity.to_string(),
                entity_id: entity.to_string(),
                alias: String::new(),
            },
            query: QueryClause::default(),
            display_fields: columns
                .iter()
                .enumerate()
                .map(|(idx, col)| DisplayField {
                    query_builder_entity_id: entity.to_string(),
                    column_name: col.clone(),
                    column_display_name: col.clone(),
                    display_sequence: idx as u32 + 1,
                })
                .collect(),
        }
    }

    pub fn with_filter(mut self, filter: Option<&Filter>) -> Self {
        self.query.filter = filter.map(|f| f.to_string());
        self
    }

    pub fn with_top_count(mut self, top_count: u32) -> Self {
        self.top_count = Some(top_count);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RootEntity {
    pub id: String,
    #[serde(rename = "entityId")]
    pub entity_id: String,
    pub alias: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryClause {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DisplayField {
    #[serde(rename = "queryBuilderEntityId")]
    pub query_builder_entity_id: String,
    #[serde(rename = "columnName")]
    pub column_name: String,
    #[serde(rename = "columnDisplayName")]
    pub column_display_name: String,
    #[serde(rename = "displaysequence")]
    pub display_sequence: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryResponse {
    #[serde(rename = "resultData", default)]
    pub result_data: Vec<Row>,
}

/// Comparison operators understood by the query filter language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    GreaterOrEqual,
    Greater,
    Equal,
}

impl Comparison {
    fn as_str(&self) -> &'static str {
        match self {
            Comparison::GreaterOrEqual => ">=",
            Comparison::Greater => ">",
            Comparison::Equal => "=",
        }
    }
}

/// A single-predicate query filter.
///
/// The remote API only accepts the predicate as text, so the field is
/// restricted to identifier characters and the literal is quote-escaped
/// when rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    field: String,
    op: Comparison,
    literal: String,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: Comparison, literal: impl Into<String>) -> Result<Self> {
        let field = field.into();
        if field.is_empty() {
            return Err(NavuError::InvalidFilter {
                reason: "field name is empty".into(),
            });
        }
        if !field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            return Err(NavuError::InvalidFilter {
                reason: format!("field name '{}' is not an identifier", field),
            });
        }
        let literal = literal.into();
        if literal.contains(['\n', '\r', '\0']) {
            return Err(NavuError::InvalidFilter {
                reason: "literal contains control characters".into(),
            });
        }
        Ok(Self { field, op, literal })
    }

    /// `field >= 'literal'`
    pub fn at_least(field: impl Into<String>, literal: impl Into<String>) -> Result<Self> {
        Self::new(field, Comparison::GreaterOrEqual, literal)
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn literal(&self) -> &str {
        &self.literal
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} '{}'",
            self.field,
            self.op.as_str(),
            self.literal.replace('\'', "''")
        )
    }
}
