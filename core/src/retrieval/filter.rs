//! Corpus filters for the two search backends.
//!
//! The same scope must be expressed two ways: a boolean filter tree for
//! the vector store and tag clauses for the keyword index. The two shapes
//! differ but are semantically equivalent.

use serde_json::{json, Value};

use super::keyword::escape_token;
use super::SearchScope;

/// Boolean metadata filter tree, rendered to the vector backend's query
/// JSON. Leaves compare a metadata field; branches combine subtrees.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataFilter {
    Eq(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    And(Vec<MetadataFilter>),
    Or(Vec<MetadataFilter>),
}

impl MetadataFilter {
    /// Render to Chroma-style `where` JSON
    pub fn to_query_json(&self) -> Value {
        match self {
            MetadataFilter::Eq(field, value) => json!({ field: value }),
            MetadataFilter::In(field, values) => json!({ field: { "$in": values } }),
            MetadataFilter::NotIn(field, values) => json!({ field: { "$nin": values } }),
            MetadataFilter::And(parts) => {
                json!({ "$and": parts.iter().map(|p| p.to_query_json()).collect::<Vec<_>>() })
            }
            MetadataFilter::Or(parts) => {
                json!({ "$or": parts.iter().map(|p| p.to_query_json()).collect::<Vec<_>>() })
            }
        }
    }
}

/// Build the vector-store filter for a scope plus an exclusion set.
pub fn vector_filter(
    scope: &SearchScope,
    shared_owner: &str,
    exclude: &[String],
) -> MetadataFilter {
    let base = match scope {
        SearchScope::Shared => MetadataFilter::Eq("user_id".into(), shared_owner.into()),
        SearchScope::UserFiles { user_id, files } => MetadataFilter::And(vec![
            MetadataFilter::Eq("user_id".into(), user_id.clone()),
            MetadataFilter::In("file_name".into(), files.clone()),
        ]),
        SearchScope::Combined { user_id, files } => MetadataFilter::Or(vec![
            MetadataFilter::And(vec![
                MetadataFilter::Eq("user_id".into(), user_id.clone()),
                MetadataFilter::In("file_name".into(), files.clone()),
            ]),
            MetadataFilter::Eq("user_id".into(), shared_owner.into()),
        ]),
    };

    if exclude.is_empty() {
        base
    } else {
        MetadataFilter::And(vec![
            base,
            MetadataFilter::NotIn("chunk_id".into(), exclude.to_vec()),
        ])
    }
}

/// Build the keyword index's tag-filter clause for a scope.
///
/// File names are matched without their extension, mirroring how the
/// index tags uploads.
pub fn keyword_scope_clause(scope: &SearchScope, shared_owner: &str) -> String {
    match scope {
        SearchScope::Shared => format!("@user_id:{{{}}}", escape_token(shared_owner)),
        SearchScope::UserFiles { user_id, files } => format!(
            "@user_id:{{{}}} @file_name:{{{}}}",
            escape_token(user_id),
            file_tag_union(files)
        ),
        SearchScope::Combined { user_id, files } => format!(
            "(@user_id:{{{}}} | (@user_id:{{{}}} @file_name:{{{}}}))",
            escape_token(shared_owner),
            escape_token(user_id),
            file_tag_union(files)
        ),
    }
}

fn file_tag_union(files: &[String]) -> String {
    files
        .iter()
        .map(|name| escape_token(strip_extension(name)))
        .collect::<Vec<_>>()
        .join("|")
}

fn strip_extension(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}
