//! Anchor-based edit operations
//!
//! The model describes edits as a JSON array of operations that locate text
//! by an anchor string instead of by line number:
//!
//! ```json
//! [{"file": "docs/a.md", "op": "insertAfter", "find": "## Setup", "insert": "New line"}]
//! ```
//!
//! A batch is parsed as a whole and applied in order; the first anchor
//! that cannot be found aborts the batch.

use docflow_common::errors::AppError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OperationError {
    #[error("Failed to parse operations JSON: {0}")]
    Parse(String),

    #[error("Could not find anchor text in {file}: {anchor}")]
    AnchorNotFound { file: String, anchor: String },

    #[error("Could not find end anchor text in {file}: {anchor}")]
    EndAnchorNotFound { file: String, anchor: String },

    #[error("Empty anchor text in operation on {file}")]
    EmptyAnchor { file: String },
}

impl From<OperationError> for AppError {
    fn from(e: OperationError) -> Self {
        match e {
            OperationError::Parse(message) => AppError::Parse { message },
            OperationError::AnchorNotFound { ref file, ref anchor }
            | OperationError::EndAnchorNotFound { ref file, ref anchor } => AppError::Apply {
                file: file.clone(),
                anchor: anchor.clone(),
                message: e.to_string(),
            },
            OperationError::EmptyAnchor { ref file } => AppError::Apply {
                file: file.clone(),
                anchor: String::new(),
                message: e.to_string(),
            },
        }
    }
}

/// The edit an operation performs at its anchor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Edit {
    /// Insert a new line after the line where the anchor ends
    InsertAfter { insert: String },
    /// Insert a new line before the line where the anchor starts
    InsertBefore { insert: String },
    /// Replace every occurrence of the anchor
    Replace { replace: String },
    /// Delete from the anchor through the next `until`, inclusive
    DeleteBlock { until: String },
}

impl Edit {
    pub fn name(&self) -> &'static str {
        match self {
            Edit::InsertAfter { .. } => "insertAfter",
            Edit::InsertBefore { .. } => "insertBefore",
            Edit::Replace { .. } => "replace",
            Edit::DeleteBlock { .. } => "deleteBlock",
        }
    }
}

/// One edit against one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub file: String,
    pub find: String,
    #[serde(flatten)]
    pub edit: Edit,
}

impl Operation {
    pub fn insert_after(file: &str, find: &str, insert: &str) -> Self {
        Self::new(file, find, Edit::InsertAfter { insert: insert.to_string() })
    }

    pub fn insert_before(file: &str, find: &str, insert: &str) -> Self {
        Self::new(file, find, Edit::InsertBefore { insert: insert.to_string() })
    }

    pub fn replace(file: &str, find: &str, replace: &str) -> Self {
        Self::new(file, find, Edit::Replace { replace: replace.to_string() })
    }

    pub fn delete_block(file: &str, find: &str, until: &str) -> Self {
        Self::new(file, find, Edit::DeleteBlock { until: until.to_string() })
    }

    fn new(file: &str, find: &str, edit: Edit) -> Self {
        Self {
            file: file.to_string(),
            find: find.to_string(),
            edit,
        }
    }

    fn anchor_not_found(&self, anchor: &str) -> OperationError {
        OperationError::AnchorNotFound {
            file: self.file.clone(),
            anchor: anchor.to_string(),
        }
    }
}

/// Strip a markdown code fence wrapped around a model response.
///
/// The opening fence and its language tag go, and so does a closing fence,
/// also when the whole reply sits on one line.
pub(crate) fn strip_code_fence(raw: &str) -> String {
    let trimmed = raw.trim();
    let Some(body) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };

    let body = body
        .trim_start_matches(|c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '+' | '_' | '.'))
        .trim();
    body.strip_suffix("```").unwrap_or(body).trim().to_string()
}

/// Parse a model response into operations.
///
/// Any malformed element fails the whole batch.
pub fn parse_operations(raw: &str) -> Result<Vec<Operation>, OperationError> {
    let cleaned = strip_code_fence(raw);
    let value: serde_json::Value = serde_json::from_str(&cleaned)
        .map_err(|e| OperationError::Parse(format!("Invalid JSON in model response: {}", e)))?;

    let items = match value {
        serde_json::Value::Array(items) => items,
        _ => return Err(OperationError::Parse("Operations JSON must be a list".to_string())),
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            serde_json::from_value::<Operation>(item)
                .map_err(|e| OperationError::Parse(format!("Invalid operation at index {}: {}", i, e)))
        })
        .collect()
}

/// Serialize operations to the stored JSON array
pub fn operations_to_json(operations: &[Operation]) -> serde_json::Value {
    serde_json::Value::Array(
        operations
            .iter()
            .filter_map(|op| serde_json::to_value(op).ok())
            .collect(),
    )
}

/// Number of line breaks before byte offset `pos`, i.e. its line index
fn line_index(text: &str, pos: usize) -> usize {
    text[..pos].matches('\n').count()
}

/// Apply one operation.
///
/// Lines are joined with `\n` so anchors may span several lines. A trailing
/// newline on the input is kept.
pub fn apply_operation(content: &str, operation: &Operation) -> Result<String, OperationError> {
    if operation.find.is_empty() {
        return Err(OperationError::EmptyAnchor {
            file: operation.file.clone(),
        });
    }

    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let joined = lines.join("\n");
    let find = operation.find.as_str();
    let start = joined
        .find(find)
        .ok_or_else(|| operation.anchor_not_found(find))?;

    let edited = match &operation.edit {
        Edit::InsertAfter { insert } => {
            let line = line_index(&joined, start + find.len());
            lines.insert((line + 1).min(lines.len()), insert.clone());
            lines.join("\n")
        }
        Edit::InsertBefore { insert } => {
            let line = line_index(&joined, start);
            lines.insert(line.min(lines.len()), insert.clone());
            lines.join("\n")
        }
        Edit::Replace { replace } => joined.replace(find, replace),
        Edit::DeleteBlock { until } => {
            if until.is_empty() {
                return Err(OperationError::EmptyAnchor {
                    file: operation.file.clone(),
                });
            }
            let offset = joined[start..]
                .find(until.as_str())
                .ok_or_else(|| OperationError::EndAnchorNotFound {
                    file: operation.file.clone(),
                    anchor: until.clone(),
                })?;
            let end = start + offset + until.len();
            format!("{}{}", &joined[..start], &joined[end..])
        }
    };

    if content.ends_with('\n') && !edited.ends_with('\n') {
        Ok(edited + "\n")
    } else {
        Ok(edited)
    }
}

/// Apply operations in order, stopping at the first failure
pub fn apply_operations(content: &str, operations: &[Operation]) -> Result<String, OperationError> {
    operations
        .iter()
        .try_fold(content.to_string(), |current, op| apply_operation(&current, op))
}

/// Check that a batch applies cleanly to `content` without keeping the result
pub fn validate_against_content(content: &str, operations: &[Operation]) -> Result<(), OperationError> {
    apply_operations(content, operations).map(|_| ())
}
