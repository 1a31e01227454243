//! Hybrid semantic + lexical search over the graph.
//!
//! Vector lookups run per `(label, facet)` pair with over-fetch and
//! uuid-dedup; chunk hits are promoted onto their parents with a matched
//! range; the BM25 path supplies fuzzy lexical recall; hybrid fusion boosts
//! semantic hits that also rank lexically and injects a handful of
//! BM25-only results. A failing facet never fails the whole query.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use globset::Glob;
use serde::Serialize;
use tracing::{debug, warn};

use crate::embed::{facets_for, FacetSource};
use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::graph::{GraphStore, Label, Node, PropertyMap};

/// Which facet family a query searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingType {
    Name,
    Content,
    Description,
    #[default]
    All,
}

impl EmbeddingType {
    fn accepts(&self, source: FacetSource) -> bool {
        matches!(
            (self, source),
            (EmbeddingType::All, _)
                | (EmbeddingType::Name, FacetSource::Name)
                | (EmbeddingType::Content, FacetSource::Content)
                | (EmbeddingType::Description, FacetSource::Description)
        )
    }
}

impl FromStr for EmbeddingType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "name" => Ok(EmbeddingType::Name),
            "content" => Ok(EmbeddingType::Content),
            "description" => Ok(EmbeddingType::Description),
            "all" => Ok(EmbeddingType::All),
            other => Err(Error::Config(format!(
                "unknown embedding type '{other}': expected name, content, description, or all"
            ))),
        }
    }
}

/// Typed property filter, AND-combined.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyFilter {
    Equals { field: String, value: serde_json::Value },
    NotEquals { field: String, value: serde_json::Value },
    Gt { field: String, value: serde_json::Value },
    Gte { field: String, value: serde_json::Value },
    Lt { field: String, value: serde_json::Value },
    Lte { field: String, value: serde_json::Value },
    Contains { field: String, value: String },
    Exists { field: String },
}

/// Search options.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub semantic: bool,
    pub hybrid: bool,
    pub embedding_type: EmbeddingType,
    pub filters: Vec<PropertyFilter>,
    /// `key op value [AND …]` conjunction, parsed into typed filters.
    pub raw_filter_clause: Option<String>,
    /// Glob over `file`/`path`/`absolutePath`.
    pub glob: Option<String>,
    pub limit: usize,
    pub offset: usize,
    pub min_score: f64,
    /// 0 disables the fuzzy operator; capped at 2.
    pub fuzzy_distance: u8,
    pub rrf_k: f64,
    /// Explicit project scope; when absent, excluded projects are filtered
    /// out.
    pub projects: Option<Vec<String>>,
    /// Restrict to these labels (all embeddable labels otherwise).
    pub labels: Option<Vec<Label>>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            semantic: true,
            hybrid: true,
            embedding_type: EmbeddingType::All,
            filters: Vec::new(),
            raw_filter_clause: None,
            glob: None,
            limit: 10,
            offset: 0,
            min_score: 0.3,
            fuzzy_distance: 1,
            rrf_k: 60.0,
            projects: None,
            labels: None,
        }
    }
}

/// Where a chunk matched inside its parent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedRange {
    pub start_line: usize,
    pub end_line: usize,
    pub start_char: usize,
    pub end_char: usize,
    pub chunk_index: usize,
    pub chunk_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_num: Option<u64>,
}

/// Provenance of a hybrid hit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RrfDetails {
    pub provenance: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bm25_rank: Option<usize>,
    pub boost: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub uuid: String,
    pub label: String,
    pub project_id: String,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub properties: PropertyMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_range: Option<MatchedRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rrf_details: Option<RrfDetails>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub total_count: usize,
}

/// Cap on in-process cosine fallback candidates.
const FALLBACK_CANDIDATES: usize = 500;
/// Cap on BM25-only injections in hybrid mode.
const BM25_INJECT_LIMIT: usize = 5;

pub struct SearchService {
    store: Arc<dyn GraphStore>,
    provider: Arc<dyn EmbeddingProvider>,
}

struct Candidate {
    score: f64,
    matched_range: Option<MatchedRange>,
    rrf: Option<RrfDetails>,
}

impl SearchService {
    pub fn new(store: Arc<dyn GraphStore>, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { store, provider }
    }

    pub async fn search(
        &self,
        query: &str,
        opts: &SearchOptions,
        excluded_projects: &HashSet<String>,
    ) -> Result<SearchResponse> {
        if query.trim().is_empty() || opts.limit == 0 {
            return Ok(SearchResponse::default());
        }

        let candidate_limit = if opts.hybrid {
            (opts.limit * 3).min(150)
        } else {
            (opts.limit * 3).min(100)
        };

        let filters = self.effective_filters(opts)?;
        let glob = opts
            .glob
            .as_deref()
            .map(|g| {
                Glob::new(g)
                    .map(|g| g.compile_matcher())
                    .map_err(|e| Error::Config(format!("invalid glob '{g}': {e}")))
            })
            .transpose()?;

        // ── Lexical path ─────────────────────────────────────────────
        let fuzzy = opts.fuzzy_distance.min(2);
        let bm25_hits: Vec<(String, f32)> = if opts.hybrid || !opts.semantic {
            match self.store.fulltext_search(query, fuzzy, candidate_limit).await {
                Ok(hits) => hits,
                Err(e) => {
                    warn!(error = %e, "lexical search failed");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        let bm25_ranks = self.promote_bm25_ranks(&bm25_hits).await?;

        // ── Vector path ──────────────────────────────────────────────
        let mut candidates: HashMap<String, Candidate> = HashMap::new();
        if opts.semantic {
            let semantic_floor = if opts.hybrid {
                // Lowered for recall; fusion and the final trim re-apply
                // the caller's threshold.
                opts.min_score * 0.5
            } else {
                opts.min_score
            };
            let raw = self.vector_candidates(query, opts, candidate_limit).await?;
            candidates = self.promote_chunks(raw, semantic_floor).await?;
        }

        // ── Fusion ───────────────────────────────────────────────────
        if opts.semantic && opts.hybrid {
            for (uuid, candidate) in candidates.iter_mut() {
                let semantic_score = candidate.score;
                match bm25_ranks.get(uuid) {
                    Some(&rank) => {
                        let boost = 1.0 + 0.3 / (rank as f64).sqrt();
                        candidate.score = semantic_score * boost;
                        candidate.rrf = Some(RrfDetails {
                            provenance: "semantic",
                            semantic_score: Some(semantic_score),
                            bm25_rank: Some(rank),
                            boost,
                        });
                    }
                    None => {
                        candidate.rrf = Some(RrfDetails {
                            provenance: "semantic",
                            semantic_score: Some(semantic_score),
                            bm25_rank: None,
                            boost: 1.0,
                        });
                    }
                }
            }
            // Up to five lexical-only hits, with descending synthetic
            // scores from 0.4.
            let mut injected = 0usize;
            let mut ranked: Vec<(&String, &usize)> = bm25_ranks.iter().collect();
            ranked.sort_by_key(|(_, &rank)| rank);
            for (uuid, &rank) in ranked {
                if injected >= BM25_INJECT_LIMIT {
                    break;
                }
                if candidates.contains_key(uuid) {
                    continue;
                }
                let score = 0.4 - 0.05 * injected as f64;
                candidates.insert(
                    uuid.clone(),
                    Candidate {
                        score,
                        matched_range: None,
                        rrf: Some(RrfDetails {
                            provenance: "bm25-only",
                            semantic_score: None,
                            bm25_rank: Some(rank),
                            boost: 1.0,
                        }),
                    },
                );
                injected += 1;
            }
        } else if !opts.semantic {
            // Lexical-only: rank-normalized scores.
            for (uuid, &rank) in &bm25_ranks {
                candidates.insert(
                    uuid.clone(),
                    Candidate {
                        score: 1.0 / (1.0 + rank as f64 / opts.rrf_k),
                        matched_range: None,
                        rrf: Some(RrfDetails {
                            provenance: "bm25-only",
                            semantic_score: None,
                            bm25_rank: Some(rank),
                            boost: 1.0,
                        }),
                    },
                );
            }
        }

        // ── Assemble, filter, trim ───────────────────────────────────
        let uuids: Vec<String> = candidates.keys().cloned().collect();
        let nodes = self.store.get_nodes(&uuids).await?;
        let nodes_by_uuid: HashMap<&str, &Node> =
            nodes.iter().map(|n| (n.uuid.as_str(), n)).collect();

        let mut hits: Vec<SearchHit> = Vec::new();
        for (uuid, candidate) in candidates {
            let Some(node) = nodes_by_uuid.get(uuid.as_str()) else {
                continue;
            };
            if candidate.score < opts.min_score {
                continue;
            }
            match &opts.projects {
                Some(projects) => {
                    if !projects.contains(&node.project_id) {
                        continue;
                    }
                }
                None => {
                    if excluded_projects.contains(&node.project_id) {
                        continue;
                    }
                }
            }
            if !filters.iter().all(|f| evaluate_filter(f, node)) {
                continue;
            }
            if let Some(matcher) = &glob {
                let path_props = ["file", "path", "absolutePath"];
                let matched = path_props.iter().any(|key| {
                    node.prop_str(key).is_some_and(|value| matcher.is_match(value))
                });
                if !matched {
                    continue;
                }
            }

            hits.push(SearchHit {
                uuid: node.uuid.clone(),
                label: node.label.as_str().to_string(),
                project_id: node.project_id.clone(),
                score: candidate.score,
                path: node
                    .prop_str("path")
                    .or_else(|| node.prop_str("file"))
                    .map(str::to_string),
                properties: strip_embeddings(&node.properties),
                matched_range: candidate.matched_range,
                rrf_details: candidate.rrf,
            });
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.uuid.cmp(&b.uuid))
        });
        let total_count = hits.len();
        let results: Vec<SearchHit> = hits
            .into_iter()
            .skip(opts.offset)
            .take(opts.limit)
            .collect();

        debug!(query, total = total_count, returned = results.len(), "search complete");
        Ok(SearchResponse {
            results,
            total_count,
        })
    }

    fn effective_filters(&self, opts: &SearchOptions) -> Result<Vec<PropertyFilter>> {
        let mut filters = opts.filters.clone();
        if let Some(clause) = &opts.raw_filter_clause {
            filters.extend(parse_raw_filter(clause)?);
        }
        Ok(filters)
    }

    /// Run every compatible `(label, facet)` vector lookup, deduplicating
    /// by uuid with the maximum score.
    async fn vector_candidates(
        &self,
        query: &str,
        opts: &SearchOptions,
        top_k: usize,
    ) -> Result<HashMap<String, f64>> {
        let vectors = self
            .provider
            .embed_batch(std::slice::from_ref(&query.to_string()))
            .await?;
        let query_vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| Error::EmbeddingProvider("empty query embedding".into()))?;

        let labels: Vec<Label> = match &opts.labels {
            Some(labels) => {
                let mut labels = labels.clone();
                // Chunk promotion depends on chunk hits being searched.
                if !labels.contains(&Label::EmbeddingChunk) {
                    labels.push(Label::EmbeddingChunk);
                }
                labels
            }
            None => Label::ALL
                .iter()
                .copied()
                .filter(|l| l.is_content())
                .collect(),
        };

        let mut merged: HashMap<String, f64> = HashMap::new();
        for label in labels {
            for facet in facets_for(label) {
                if !opts.embedding_type.accepts(facet.source) {
                    continue;
                }
                let result = self
                    .facet_lookup(label, facet.property, &query_vector, top_k)
                    .await;
                let hits = match result {
                    Ok(hits) => hits,
                    Err(e) => {
                        // A failing facet does not fail the query.
                        warn!(label = %label, facet = facet.property, error = %e, "facet lookup failed");
                        continue;
                    }
                };
                for (uuid, score) in hits {
                    let score = score as f64;
                    merged
                        .entry(uuid)
                        .and_modify(|existing| *existing = existing.max(score))
                        .or_insert(score);
                }
            }
        }
        Ok(merged)
    }

    async fn facet_lookup(
        &self,
        label: Label,
        property: &str,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<(String, f32)>> {
        if self.store.has_vector_index(label, property).await? {
            return self.store.vector_search(label, property, query_vector, top_k).await;
        }
        // Mandated fallback: load capped candidates and score in-process.
        debug!(label = %label, property, "vector index absent, in-process cosine fallback");
        let candidates = self
            .store
            .embedding_candidates(label, property, FALLBACK_CANDIDATES)
            .await?;
        let mut scored: Vec<(String, f32)> = candidates
            .into_iter()
            .map(|(uuid, vector)| (uuid, cosine_similarity(query_vector, &vector)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    /// Replace chunk hits with their parents, keeping the matched range of
    /// the winning chunk. Direct parent hits win on score.
    async fn promote_chunks(
        &self,
        raw: HashMap<String, f64>,
        min_score: f64,
    ) -> Result<HashMap<String, Candidate>> {
        let uuids: Vec<String> = raw.keys().cloned().collect();
        let nodes = self.store.get_nodes(&uuids).await?;
        let nodes_by_uuid: HashMap<&str, &Node> =
            nodes.iter().map(|n| (n.uuid.as_str(), n)).collect();

        let mut out: HashMap<String, Candidate> = HashMap::new();
        for (uuid, score) in raw {
            if score < min_score {
                continue;
            }
            let Some(node) = nodes_by_uuid.get(uuid.as_str()) else {
                continue;
            };
            if node.label != Label::EmbeddingChunk {
                match out.entry(uuid) {
                    std::collections::hash_map::Entry::Occupied(mut entry) => {
                        if score > entry.get().score {
                            entry.insert(Candidate {
                                score,
                                matched_range: None,
                                rrf: None,
                            });
                        }
                    }
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        entry.insert(Candidate {
                            score,
                            matched_range: None,
                            rrf: None,
                        });
                    }
                }
                continue;
            }

            // Chunk hits are never returned directly.
            let Some(parent_uuid) = node.prop_str("parentUuid").map(str::to_string) else {
                continue;
            };
            let range = MatchedRange {
                start_line: node.prop_u64("startLine").unwrap_or(0) as usize,
                end_line: node.prop_u64("endLine").unwrap_or(0) as usize,
                start_char: node.prop_u64("startChar").unwrap_or(0) as usize,
                end_char: node.prop_u64("endChar").unwrap_or(0) as usize,
                chunk_index: node.prop_u64("chunkIndex").unwrap_or(0) as usize,
                chunk_score: score,
                chunk_text: node.prop_str("text").map(str::to_string),
                page_num: node.prop_u64("pageNum"),
            };
            match out.entry(parent_uuid) {
                std::collections::hash_map::Entry::Occupied(mut entry) => {
                    if score > entry.get().score {
                        entry.insert(Candidate {
                            score,
                            matched_range: Some(range),
                            rrf: None,
                        });
                    }
                }
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert(Candidate {
                        score,
                        matched_range: Some(range),
                        rrf: None,
                    });
                }
            }
        }
        Ok(out)
    }

    /// Chunk-aware BM25 rank map: chunk hits count as their parents; a
    /// node's rank is its best one.
    async fn promote_bm25_ranks(
        &self,
        hits: &[(String, f32)],
    ) -> Result<HashMap<String, usize>> {
        let uuids: Vec<String> = hits.iter().map(|(uuid, _)| uuid.clone()).collect();
        let nodes = self.store.get_nodes(&uuids).await?;
        let nodes_by_uuid: HashMap<&str, &Node> =
            nodes.iter().map(|n| (n.uuid.as_str(), n)).collect();

        let mut ranks: HashMap<String, usize> = HashMap::new();
        for (position, (uuid, _score)) in hits.iter().enumerate() {
            let rank = position + 1;
            let resolved = match nodes_by_uuid.get(uuid.as_str()) {
                Some(node) if node.label == Label::EmbeddingChunk => {
                    match node.prop_str("parentUuid") {
                        Some(parent) => parent.to_string(),
                        None => continue,
                    }
                }
                Some(node) => node.uuid.clone(),
                None => continue,
            };
            ranks.entry(resolved).or_insert(rank);
        }
        Ok(ranks)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Embedding-valued properties are stripped from returned nodes.
fn strip_embeddings(properties: &PropertyMap) -> PropertyMap {
    properties
        .iter()
        .filter(|(key, _)| !key.starts_with("embedding"))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Parse a raw filter clause: `key op value` terms joined by `AND`.
/// Operators: `=`, `!=`, `>=`, `<=`, `>`, `<`, `CONTAINS`.
pub fn parse_raw_filter(clause: &str) -> Result<Vec<PropertyFilter>> {
    let mut filters = Vec::new();
    for term in clause.split(" AND ") {
        let term = term.trim();
        if term.is_empty() {
            continue;
        }
        let (field, op, raw_value) = split_filter_term(term)
            .ok_or_else(|| Error::Config(format!("invalid filter term '{term}'")))?;
        let value = parse_filter_value(raw_value);
        let field = field.to_string();
        filters.push(match op {
            "=" => PropertyFilter::Equals { field, value },
            "!=" => PropertyFilter::NotEquals { field, value },
            ">" => PropertyFilter::Gt { field, value },
            ">=" => PropertyFilter::Gte { field, value },
            "<" => PropertyFilter::Lt { field, value },
            "<=" => PropertyFilter::Lte { field, value },
            "CONTAINS" => PropertyFilter::Contains {
                field,
                value: match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                },
            },
            _ => unreachable!(),
        });
    }
    Ok(filters)
}

fn split_filter_term(term: &str) -> Option<(&str, &str, &str)> {
    for op in [" CONTAINS ", ">=", "<=", "!=", "=", ">", "<"] {
        if let Some(pos) = term.find(op) {
            let field = term[..pos].trim();
            let value = term[pos + op.len()..].trim();
            if field.is_empty() || value.is_empty() {
                return None;
            }
            return Some((field, op.trim(), value));
        }
    }
    None
}

fn parse_filter_value(raw: &str) -> serde_json::Value {
    let unquoted = raw
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
    if let Some(s) = unquoted {
        return serde_json::Value::String(s.to_string());
    }
    if let Ok(n) = raw.parse::<i64>() {
        return serde_json::json!(n);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return serde_json::json!(f);
    }
    match raw {
        "true" => serde_json::Value::Bool(true),
        "false" => serde_json::Value::Bool(false),
        _ => serde_json::Value::String(raw.to_string()),
    }
}

/// Resolve a filter field on a node; `label` and `projectId` are virtual.
fn field_value(node: &Node, field: &str) -> Option<serde_json::Value> {
    match field {
        "label" => Some(serde_json::Value::String(node.label.as_str().to_string())),
        "projectId" => Some(serde_json::Value::String(node.project_id.clone())),
        "uuid" => Some(serde_json::Value::String(node.uuid.clone())),
        _ => node.properties.get(field).cloned(),
    }
}

fn numeric(v: &serde_json::Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_i64().map(|i| i as f64))
}

fn compare(a: &serde_json::Value, b: &serde_json::Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (numeric(a), numeric(b)) {
        return x.partial_cmp(&y);
    }
    match (a.as_str(), b.as_str()) {
        (Some(x), Some(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Evaluate one filter against a node.
pub fn evaluate_filter(filter: &PropertyFilter, node: &Node) -> bool {
    use std::cmp::Ordering;
    match filter {
        PropertyFilter::Equals { field, value } => {
            field_value(node, field).as_ref() == Some(value)
        }
        PropertyFilter::NotEquals { field, value } => {
            field_value(node, field).as_ref() != Some(value)
        }
        PropertyFilter::Gt { field, value } => {
            field_value(node, field)
                .and_then(|v| compare(&v, value))
                .is_some_and(|o| o == Ordering::Greater)
        }
        PropertyFilter::Gte { field, value } => field_value(node, field)
            .and_then(|v| compare(&v, value))
            .is_some_and(|o| o != Ordering::Less),
        PropertyFilter::Lt { field, value } => {
            field_value(node, field)
                .and_then(|v| compare(&v, value))
                .is_some_and(|o| o == Ordering::Less)
        }
        PropertyFilter::Lte { field, value } => field_value(node, field)
            .and_then(|v| compare(&v, value))
            .is_some_and(|o| o != Ordering::Greater),
        PropertyFilter::Contains { field, value } => field_value(node, field)
            .and_then(|v| v.as_str().map(|s| s.contains(value.as_str())))
            .unwrap_or(false),
        PropertyFilter::Exists { field } => field_value(node, field)
            .map(|v| !v.is_null())
            .unwrap_or(false),
    }
}
