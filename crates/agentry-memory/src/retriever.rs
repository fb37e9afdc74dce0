//! Ranked retrieval over the memory store: a weighted blend of keyword
//! overlap, semantic similarity, recency, access frequency and stored
//! importance, followed by an MMR pass so the top results aren't five
//! near-duplicates of the same memory.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use agentry_core::{AgentError, MemoryEntry, MemoryKind};
use moka::future::Cache;
use time::OffsetDateTime;

use crate::store::MemoryStore;

#[derive(Debug, Clone, Copy)]
pub struct RetrievalWeights {
    pub keyword: f32,
    pub semantic: f32,
    pub recency: f32,
    pub access: f32,
    pub importance: f32,
}

impl RetrievalWeights {
    /// Used when no embedding is available for the query or any candidate:
    /// semantic weight is folded into keyword rather than wasted.
    pub const NO_SEMANTIC: Self = Self {
        keyword: 0.60,
        semantic: 0.0,
        recency: 0.20,
        access: 0.10,
        importance: 0.10,
    };
}

impl Default for RetrievalWeights {
    fn default() -> Self {
        Self {
            keyword: 0.35,
            semantic: 0.25,
            recency: 0.20,
            access: 0.10,
            importance: 0.10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    pub weights: RetrievalWeights,
    pub candidate_pool: usize,
    /// MMR tradeoff between relevance and diversity; 1.0 is pure relevance.
    pub mmr_lambda: f32,
    pub cache_ttl: StdDuration,
    pub cache_capacity: u64,
    /// Spec §4.6 step 4: also search a stop-word-stripped and a
    /// synonym-expanded rewrite of the query, merging candidates by id.
    pub enable_query_rewrite: bool,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            weights: RetrievalWeights::default(),
            candidate_pool: 40,
            mmr_lambda: 0.7,
            cache_ttl: StdDuration::from_secs(30),
            cache_capacity: 256,
            enable_query_rewrite: true,
        }
    }
}

/// Recency decay constant from spec §4.6 step 3 (`time_score = exp(-age_days/tau)`).
const RECENCY_TAU_DAYS: f64 = 30.0;

/// Access-frequency saturation point from spec §4.6 step 3
/// (`access_score = min(1, log(1+access_count)/log(1+100))`).
const ACCESS_SATURATION: f64 = 100.0;

/// A small, fixed set of terms carrying little discriminative weight for
/// keyword overlap. Deliberately short — this is a budget input to the
/// rewrite step, not a general-purpose NLP stopword list.
const STOPWORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "to", "of", "in", "on",
    "for", "with", "and", "or", "but", "it", "this", "that", "at", "by", "from", "as", "my", "me",
    "i", "you", "your", "please", "can", "could", "would", "should",
];

/// Domain synonyms for the kinds of entities and actions this runtime's
/// recent-entity tracker and tool catalog traffic in (spec §4.6 "small
/// domain lexicon"). Each query term expands to itself plus any listed
/// alternates.
const SYNONYMS: &[(&str, &[&str])] = &[
    ("delete", &["remove", "rm", "trash"]),
    ("remove", &["delete", "rm"]),
    ("create", &["make", "new", "add"]),
    ("folder", &["directory", "dir"]),
    ("directory", &["folder", "dir"]),
    ("file", &["document", "doc"]),
    ("open", &["launch", "start"]),
    ("fetch", &["download", "get", "retrieve"]),
    ("error", &["bug", "issue", "failure"]),
    ("bug", &["error", "issue"]),
];

fn strip_stopwords(query: &str) -> Option<String> {
    let kept: Vec<&str> = query
        .split_whitespace()
        .filter(|term| !STOPWORDS.contains(&term.to_lowercase().as_str()))
        .collect();
    if kept.is_empty() || kept.len() == query.split_whitespace().count() {
        return None;
    }
    Some(kept.join(" "))
}

fn expand_synonyms(query: &str) -> Option<String> {
    let mut expanded = false;
    let mut terms: Vec<String> = Vec::new();
    for term in query.split_whitespace() {
        terms.push(term.to_string());
        let lower = term.to_lowercase();
        if let Some((_, alternates)) = SYNONYMS.iter().find(|(word, _)| *word == lower) {
            expanded = true;
            terms.extend(alternates.iter().map(|s| s.to_string()));
        }
    }
    expanded.then(|| terms.join(" "))
}

#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub entry: MemoryEntry,
    pub score: f32,
}

pub struct Retriever {
    store: Arc<dyn MemoryStore>,
    config: RetrieverConfig,
    cache: Cache<String, Vec<MemoryEntry>>,
}

impl Retriever {
    pub fn new(store: Arc<dyn MemoryStore>, config: RetrieverConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(config.cache_ttl)
            .build();
        Self { store, config, cache }
    }

    fn keyword_overlap(query_terms: &[String], entry: &MemoryEntry) -> f32 {
        if query_terms.is_empty() || entry.keywords.is_empty() {
            return 0.0;
        }
        let hits = query_terms.iter().filter(|term| entry.keywords.contains(*term)).count();
        hits as f32 / query_terms.len() as f32
    }

    fn semantic_similarity(query_embedding: Option<&[f32]>, entry: &MemoryEntry) -> Option<f32> {
        let query = query_embedding?;
        let candidate = entry.embedding.as_deref()?;
        if query.len() != candidate.len() || query.is_empty() {
            return None;
        }
        let dot: f32 = query.iter().zip(candidate).map(|(a, b)| a * b).sum();
        let norm_q: f32 = query.iter().map(|v| v * v).sum::<f32>().sqrt();
        let norm_c: f32 = candidate.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm_q == 0.0 || norm_c == 0.0 {
            return Some(0.0);
        }
        Some((dot / (norm_q * norm_c)).clamp(-1.0, 1.0))
    }

    /// `exp(-age_days / tau)` with the fixed `tau=30` from spec §4.6 step 3
    /// — not a configurable half-life, the same fixed-constant stance as
    /// the relevance/MMR weights.
    fn recency_score(&self, entry: &MemoryEntry, now: OffsetDateTime) -> f32 {
        let age_days = entry.created_at.age(now).as_seconds_f64().max(0.0) / 86_400.0;
        (-age_days / RECENCY_TAU_DAYS).exp() as f32
    }

    /// `min(1, log(1+access_count) / log(1+100))` from spec §4.6 step 3.
    fn access_score(entry: &MemoryEntry) -> f32 {
        let numerator = (1.0 + entry.access_count as f64).ln();
        let denominator = (1.0 + ACCESS_SATURATION).ln();
        (numerator / denominator).min(1.0) as f32
    }

    fn score(&self, query_terms: &[String], query_embedding: Option<&[f32]>, entry: &MemoryEntry, now: OffsetDateTime) -> f32 {
        let semantic = Self::semantic_similarity(query_embedding, entry);
        let weights = if semantic.is_some() { self.config.weights } else { RetrievalWeights::NO_SEMANTIC };

        weights.keyword * Self::keyword_overlap(query_terms, entry)
            + weights.semantic * semantic.unwrap_or(0.0)
            + weights.recency * self.recency_score(entry, now)
            + weights.access * Self::access_score(entry)
            + weights.importance * entry.importance
    }

    /// MMR re-ranking: greedily pick the highest-scoring remaining candidate
    /// penalized by its keyword-overlap similarity to what's already picked,
    /// so near-duplicate memories don't crowd out distinct ones.
    fn mmr_select(&self, mut candidates: Vec<ScoredMemory>, top_k: usize) -> Vec<ScoredMemory> {
        let mut selected: Vec<ScoredMemory> = Vec::new();
        let lambda = self.config.mmr_lambda;

        while !candidates.is_empty() && selected.len() < top_k {
            let mut best_idx = 0;
            let mut best_value = f32::MIN;
            for (idx, candidate) in candidates.iter().enumerate() {
                let max_similarity = selected
                    .iter()
                    .map(|picked| keyword_jaccard(&picked.entry.keywords, &candidate.entry.keywords))
                    .fold(0.0_f32, f32::max);
                let value = lambda * candidate.score - (1.0 - lambda) * max_similarity;
                if value > best_value {
                    best_value = value;
                    best_idx = idx;
                }
            }
            selected.push(candidates.remove(best_idx));
        }
        selected
    }

    async fn candidates_for(&self, query: &str) -> Result<Vec<MemoryEntry>, AgentError> {
        match self.cache.get(query).await {
            Some(cached) => Ok(cached),
            None => {
                let fetched = self.store.search_keyword(query, self.config.candidate_pool).await?;
                self.cache.insert(query.to_string(), fetched.clone()).await;
                Ok(fetched)
            }
        }
    }

    /// Spec §4.6's per-call contract: `retrieve(query, top_k=5, kind_filter=None)`.
    pub async fn retrieve(
        &self,
        query: &str,
        query_embedding: Option<&[f32]>,
        top_k: usize,
        kind_filter: Option<MemoryKind>,
    ) -> Result<Vec<ScoredMemory>, AgentError> {
        let mut by_id: std::collections::HashMap<String, MemoryEntry> = std::collections::HashMap::new();
        for entry in self.candidates_for(query).await? {
            by_id.insert(entry.id.clone(), entry);
        }

        // Spec §4.6 step 4: search up to two rewrites as well, merging and
        // deduplicating by id (a candidate found by more than one form is
        // kept once; its relevance score is computed from the original
        // query terms regardless of which form surfaced it).
        if self.config.enable_query_rewrite {
            for rewrite in [strip_stopwords(query), expand_synonyms(query)].into_iter().flatten() {
                for entry in self.candidates_for(&rewrite).await? {
                    by_id.entry(entry.id.clone()).or_insert(entry);
                }
            }
        }

        if let Some(kind) = kind_filter {
            by_id.retain(|_, entry| entry.kind == kind);
        }

        let query_terms: Vec<String> = query.split_whitespace().map(|s| s.to_lowercase()).collect();
        let now = OffsetDateTime::now_utc();

        let mut scored: Vec<ScoredMemory> = by_id
            .into_values()
            .map(|entry| {
                let score = self.score(&query_terms, query_embedding, &entry, now);
                ScoredMemory { entry, score }
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let selected = self.mmr_select(scored, top_k);
        for item in &selected {
            let _ = self.store.record_access(&item.entry.id).await;
        }
        Ok(selected)
    }
}

fn keyword_jaccard(a: &std::collections::HashSet<String>, b: &std::collections::HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f32;
    let union = a.union(b).count().max(1) as f32;
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteMemoryStore;
    use std::collections::HashSet;

    fn kw(words: &[&str]) -> HashSet<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn keyword_only_scoring_prefers_exact_term_overlap() {
        let store = Arc::new(SqliteMemoryStore::open_in_memory().await.unwrap());
        store
            .insert(MemoryEntry::new(MemoryKind::Interaction, "deployed the payments service", kw(&["deployed", "payments"]), 0.5, None))
            .await
            .unwrap();
        store
            .insert(MemoryEntry::new(MemoryKind::Interaction, "ordered lunch for the team", kw(&["lunch", "team"]), 0.5, None))
            .await
            .unwrap();

        let retriever = Retriever::new(store, RetrieverConfig::default());
        let results = retriever.retrieve("payments deployment", None, 5, None).await.unwrap();
        assert!(!results.is_empty());
        assert!(results[0].entry.content.contains("payments"));
    }

    #[tokio::test]
    async fn mmr_caps_result_count_at_requested_top_k() {
        let store = Arc::new(SqliteMemoryStore::open_in_memory().await.unwrap());
        for i in 0..20 {
            store
                .insert(MemoryEntry::new(MemoryKind::Interaction, format!("note about topic {i}"), kw(&["topic"]), 0.3, None))
                .await
                .unwrap();
        }
        let config = RetrieverConfig { candidate_pool: 20, ..RetrieverConfig::default() };
        let retriever = Retriever::new(store, config);
        let results = retriever.retrieve("topic", None, 5, None).await.unwrap();
        assert_eq!(results.len(), 5);
    }

    #[tokio::test]
    async fn kind_filter_excludes_entries_of_other_kinds() {
        let store = Arc::new(SqliteMemoryStore::open_in_memory().await.unwrap());
        store
            .insert(MemoryEntry::new(MemoryKind::Interaction, "deployed the payments service", kw(&["deployed", "payments"]), 0.5, None))
            .await
            .unwrap();
        store
            .insert(MemoryEntry::new(MemoryKind::Insight, "payments deploys should be staggered", kw(&["deployed", "payments"]), 0.5, None))
            .await
            .unwrap();

        let retriever = Retriever::new(store, RetrieverConfig::default());
        let results = retriever.retrieve("payments deployment", None, 5, Some(MemoryKind::Insight)).await.unwrap();
        assert!(results.iter().all(|r| r.entry.kind == MemoryKind::Insight));
        assert!(results.iter().any(|r| r.entry.content.contains("staggered")));
    }

    #[tokio::test]
    async fn synonym_rewrite_surfaces_entries_missing_the_literal_query_term() {
        let store = Arc::new(SqliteMemoryStore::open_in_memory().await.unwrap());
        store
            .insert(MemoryEntry::new(MemoryKind::Interaction, "removed the old config directory", kw(&["removed", "config", "directory"]), 0.4, None))
            .await
            .unwrap();

        let retriever = Retriever::new(store, RetrieverConfig::default());
        // "delete ... folder" never appears verbatim; the synonym lexicon
        // expands delete->remove and folder->directory so the entry is
        // still reachable.
        let results = retriever.retrieve("delete the folder", None, 5, None).await.unwrap();
        assert!(results.iter().any(|r| r.entry.content.contains("removed the old config directory")));
    }

    #[tokio::test]
    async fn disabling_query_rewrite_misses_the_synonym_only_match() {
        let store = Arc::new(SqliteMemoryStore::open_in_memory().await.unwrap());
        store
            .insert(MemoryEntry::new(MemoryKind::Interaction, "removed the old config directory", kw(&["removed", "config", "directory"]), 0.4, None))
            .await
            .unwrap();

        let config = RetrieverConfig { enable_query_rewrite: false, ..RetrieverConfig::default() };
        let retriever = Retriever::new(store, config);
        let results = retriever.retrieve("delete the folder", None, 5, None).await.unwrap();
        assert!(results.is_empty());
    }
}
