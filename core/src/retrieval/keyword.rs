//! Keyword (lexical) search: weighted query building and the RediSearch
//! backend adapter.
//!
//! Query tokens are stopword-filtered and expanded into weighted
//! disjuncts over n-grams up to size 2. Pairs outweigh single tokens so
//! documents containing several query terms beat documents saturated
//! with one common term, countering plain BM25's single-term bias.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use tracing::debug;

use super::filter::keyword_scope_clause;
use super::{ScoredDocument, SearchScope};
use crate::{Result, SkeinError};

/// N-gram size cap for keyword combinations
const TUPLE_LIMIT: u32 = 2;
/// Weight multiplier per extra combination member
const BOOST_FACTOR: u32 = 2;

/// Common English stopwords dropped from keyword queries.
const STOPWORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "all", "am", "an", "and", "any", "are", "as", "at",
    "be", "because", "been", "before", "being", "below", "between", "both", "but", "by", "can",
    "did", "do", "does", "doing", "down", "during", "each", "few", "for", "from", "further",
    "had", "has", "have", "having", "he", "her", "here", "hers", "him", "his", "how", "i", "if",
    "in", "into", "is", "it", "its", "just", "me", "more", "most", "my", "no", "nor", "not",
    "now", "of", "off", "on", "once", "only", "or", "other", "our", "out", "over", "own", "s",
    "same", "she", "should", "so", "some", "such", "t", "than", "that", "the", "their", "them",
    "then", "there", "these", "they", "this", "those", "through", "to", "too", "under", "until",
    "up", "very", "was", "we", "were", "what", "when", "where", "which", "while", "who", "whom",
    "why", "will", "with", "you", "your", "yours",
];

/// A query term with its disjunct weight
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedTerm {
    pub text: String,
    pub weight: u32,
}

/// Lowercase, tokenize, and drop stopwords and single-character tokens.
pub fn extract_keywords(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 1 && !STOPWORDS.contains(t))
        .map(|t| t.to_string())
        .collect()
}

/// Escape query-syntax punctuation so a token is safe to embed in a
/// search expression (e.g. "can't" -> "can\'t").
pub fn escape_token(token: &str) -> String {
    let mut out = String::with_capacity(token.len());
    for c in token.chars() {
        if c.is_ascii_punctuation() {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Expand keywords into weighted disjuncts: every single token at weight
/// 1, every ordered pair at weight `BOOST_FACTOR`, and, when more than
/// two keywords survive filtering, the full combination at a higher
/// boost still.
pub fn build_weighted_terms(keywords: &[String]) -> Vec<WeightedTerm> {
    let mut terms = Vec::new();

    for size in 1..=TUPLE_LIMIT as usize {
        push_combinations(keywords, size, &mut terms);
    }

    if keywords.len() > 2 {
        terms.push(WeightedTerm {
            text: keywords.join(" "),
            weight: BOOST_FACTOR.pow(TUPLE_LIMIT + 1),
        });
    }

    terms
}

fn push_combinations(keywords: &[String], size: usize, out: &mut Vec<WeightedTerm>) {
    let weight = BOOST_FACTOR.pow(size as u32 - 1);
    match size {
        1 => {
            for k in keywords {
                out.push(WeightedTerm {
                    text: k.clone(),
                    weight,
                });
            }
        }
        2 => {
            for i in 0..keywords.len() {
                for j in (i + 1)..keywords.len() {
                    out.push(WeightedTerm {
                        text: format!("{} {}", keywords[i], keywords[j]),
                        weight,
                    });
                }
            }
        }
        _ => {}
    }
}

/// Render the full search expression: weighted text disjuncts, the scope
/// tag clause, and per-id negative clauses for the exclusion set.
pub fn build_search_expression(
    terms: &[WeightedTerm],
    scope: &SearchScope,
    shared_owner: &str,
    exclude: &[String],
) -> String {
    let disjuncts = terms
        .iter()
        .map(|t| format!("({}) => {{ $weight: {} }}", escape_token(&t.text), t.weight))
        .collect::<Vec<_>>()
        .join(" | ");

    let mut query = format!("@text:({})", disjuncts);
    query.push(' ');
    query.push_str(&keyword_scope_clause(scope, shared_owner));
    for id in exclude {
        query.push_str(&format!(" -@id:({})", escape_token(id)));
    }
    query
}

/// Lexical search seam. Implementations score with BM25 (higher is
/// better) and push scope and exclusion filtering into the backend.
#[async_trait]
pub trait KeywordIndex: Send + Sync {
    async fn search(
        &self,
        terms: &[WeightedTerm],
        top_k: usize,
        scope: &SearchScope,
        exclude: &[String],
    ) -> Result<Vec<ScoredDocument>>;
}

/// Configuration for the RediSearch adapter
#[derive(Debug, Clone)]
pub struct RedisKeywordIndexConfig {
    pub url: String,
    pub index: String,
    pub shared_owner: String,
}

impl Default for RedisKeywordIndexConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("REDIS_URL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "redis://127.0.0.1:6379/0".to_string()),
            index: std::env::var("REDIS_INDEX_NAME")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "documents".to_string()),
            shared_owner: std::env::var("SHARED_CORPUS_OWNER")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "shared".to_string()),
        }
    }
}

/// RediSearch full-text adapter (`FT.SEARCH` with the BM25 scorer).
#[derive(Clone)]
pub struct RedisKeywordIndex {
    conn: ConnectionManager,
    cfg: RedisKeywordIndexConfig,
}

impl RedisKeywordIndex {
    pub async fn connect(cfg: RedisKeywordIndexConfig) -> Result<Self> {
        let client = redis::Client::open(cfg.url.as_str())
            .map_err(|e| SkeinError::Retrieval(format!("Invalid Redis URL: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| SkeinError::Retrieval(format!("Redis connection failed: {e}")))?;
        Ok(Self { conn, cfg })
    }
}

#[async_trait]
impl KeywordIndex for RedisKeywordIndex {
    async fn search(
        &self,
        terms: &[WeightedTerm],
        top_k: usize,
        scope: &SearchScope,
        exclude: &[String],
    ) -> Result<Vec<ScoredDocument>> {
        let query = build_search_expression(terms, scope, &self.cfg.shared_owner, exclude);
        debug!(target: "keyword_index", index = %self.cfg.index, query = %query, "FT.SEARCH");

        let mut conn = self.conn.clone();
        let reply: redis::Value = redis::cmd("FT.SEARCH")
            .arg(&self.cfg.index)
            .arg(&query)
            .arg("DIALECT")
            .arg(2)
            .arg("SCORER")
            .arg("BM25")
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(top_k)
            .query_async(&mut conn)
            .await
            .map_err(|e| SkeinError::Retrieval(format!("FT.SEARCH failed: {e}")))?;

        Ok(parse_search_reply(&reply))
    }
}

/// Parse an `FT.SEARCH ... WITHSCORES` reply:
/// `[total, id, score, [field, value, ...], id, score, [...], ...]`
fn parse_search_reply(reply: &redis::Value) -> Vec<ScoredDocument> {
    let redis::Value::Array(items) = reply else {
        return Vec::new();
    };

    let mut docs = Vec::new();
    let mut iter = items.iter().skip(1); // skip total count

    while let Some(id_value) = iter.next() {
        let Some(id) = value_to_string(id_value) else {
            continue;
        };
        let score = iter
            .next()
            .and_then(value_to_string)
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);

        let mut text = String::new();
        let mut metadata = HashMap::new();
        if let Some(redis::Value::Array(fields)) = iter.next() {
            for pair in fields.chunks(2) {
                let (Some(key), Some(value)) = (
                    pair.first().and_then(value_to_string),
                    pair.get(1).and_then(value_to_string),
                ) else {
                    continue;
                };
                if key == "text" {
                    text = value;
                } else {
                    metadata.insert(key, serde_json::Value::String(value));
                }
            }
        }

        docs.push(ScoredDocument {
            id,
            text,
            metadata,
            score,
        });
    }

    docs
}

fn value_to_string(v: &redis::Value) -> Option<String> {
    match v {
        redis::Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        redis::Value::SimpleString(s) => Some(s.clone()),
        redis::Value::Int(i) => Some(i.to_string()),
        redis::Value::Double(d) => Some(d.to_string()),
        _ => None,
    }
}
