// Inverted Full-Text Index
// Position-bearing postings over `path_text` (always) and `body_text` (only
// for cleanly parsed documents). Mutations hit a live segment owned by the
// ingest orchestrator; readers query an immutable snapshot that a background
// task refreshes on a timer, so a query never sees a half-applied batch and
// two identical queries inside one snapshot return identical results.

pub mod tokenizer;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::errors::EngineUnavailableReason;
use crate::types::DocId;
use tokenizer::{analyze, parse_query, QueryTerm, Token};

const K1: f64 = 1.2;
const B: f64 = 0.75;
/// Path hits count double: a filename match is a stronger signal than one
/// body occurrence.
const PATH_WEIGHT: f64 = 2.0;

/// Per-document metadata carried into hits without a store round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocMeta {
    pub rel_path: String,
    pub repo: String,
    pub mtime: i64,
    pub size: u64,
    pub has_body: bool,
    pub body_tokens: u32,
}

/// Positions (token index) and byte offsets of one term in one field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldPostings {
    pub positions: Vec<u32>,
    pub offsets: Vec<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocPostings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<FieldPostings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<FieldPostings>,
}

/// The mutable index state. Cloned into an immutable snapshot on reload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Segment {
    seq: u64,
    config_hash: String,
    docs: BTreeMap<DocId, DocMeta>,
    doc_terms: BTreeMap<DocId, Vec<String>>,
    terms: HashMap<String, BTreeMap<DocId, DocPostings>>,
    total_body_tokens: u64,
}

/// Immutable point-in-time view served to queries.
pub struct Snapshot {
    segment: Segment,
}

/// One text-level hit, before store-side filtering and final ranking.
#[derive(Debug, Clone)]
pub struct TextHit {
    pub doc_id: DocId,
    pub score: f64,
    pub match_count: usize,
    pub mtime: i64,
    pub size: u64,
    /// Byte offset of the first body match, for preview extraction.
    pub first_offset: Option<u32>,
    /// All query tokens appear consecutively in the body.
    pub exact_match: bool,
    /// Whether any match landed in the path field only.
    pub path_only: bool,
}

/// Status surfaced by `engine status` and `doctor`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub doc_count: usize,
    pub index_version: String,
    pub snapshot_age_ms: u64,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unavailable_reason: Option<EngineUnavailableReason>,
}

pub struct TextIndexEngine {
    dir: PathBuf,
    max_doc_bytes: usize,
    live: RwLock<Segment>,
    snapshot: RwLock<Arc<Snapshot>>,
    snapshot_taken: RwLock<std::time::Instant>,
    availability: RwLock<Option<EngineUnavailableReason>>,
}

impl TextIndexEngine {
    /// Open or create the index under `dir`. An existing segment written
    /// under a different config hash makes the engine unavailable until a
    /// rebuild, rather than serving results ranked under stale rules.
    pub fn open(dir: &Path, max_doc_bytes: usize, config_hash: &str) -> Result<Arc<Self>> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create text index dir {}", dir.display()))?;

        let mut availability = None;
        let segment_path = dir.join("segment.json");
        let segment = if segment_path.exists() {
            let raw = std::fs::read(&segment_path)
                .with_context(|| format!("failed to read {}", segment_path.display()))?;
            match serde_json::from_slice::<Segment>(&raw) {
                Ok(segment) if segment.config_hash == config_hash => segment,
                Ok(_) => {
                    tracing::warn!("text index built under a different config, rebuild required");
                    availability = Some(EngineUnavailableReason::ConfigMismatch);
                    Segment {
                        config_hash: config_hash.to_string(),
                        ..Segment::default()
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "corrupt text index segment, rebuild required");
                    availability = Some(EngineUnavailableReason::IndexMissing);
                    Segment {
                        config_hash: config_hash.to_string(),
                        ..Segment::default()
                    }
                }
            }
        } else {
            Segment {
                config_hash: config_hash.to_string(),
                ..Segment::default()
            }
        };

        let snapshot = Arc::new(Snapshot {
            segment: segment.clone(),
        });
        Ok(Arc::new(Self {
            dir: dir.to_path_buf(),
            max_doc_bytes,
            live: RwLock::new(segment),
            snapshot: RwLock::new(snapshot),
            snapshot_taken: RwLock::new(std::time::Instant::now()),
            availability: RwLock::new(availability),
        }))
    }

    pub fn availability(&self) -> Option<EngineUnavailableReason> {
        *self.availability.read()
    }

    /// Enter or leave rollback mode (set while a deployment rollback is in
    /// flight so clients get a precise reason).
    pub fn set_rollback_mode(&self, on: bool) {
        let mut availability = self.availability.write();
        match (on, *availability) {
            (true, _) => *availability = Some(EngineUnavailableReason::RollbackMode),
            (false, Some(EngineUnavailableReason::RollbackMode)) => *availability = None,
            (false, _) => {}
        }
    }

    /// Mark the index consistent again (after a rebuild).
    pub fn mark_available(&self) {
        *self.availability.write() = None;
    }

    // ---- Write side (ingest orchestrator only) ----

    /// Insert or replace one document. Idempotent: the same inputs produce
    /// the same postings.
    pub fn upsert(
        &self,
        doc_id: &DocId,
        body: Option<&str>,
        mtime: i64,
        size: u64,
    ) {
        let mut live = self.live.write();
        Self::remove_doc(&mut live, doc_id);

        let path_text = format!("{} {}", doc_id.as_str(), doc_id.rel_path());
        let path_tokens = analyze(&path_text);

        let body_tokens: Vec<Token> = match body {
            Some(text) => {
                let capped = if text.len() > self.max_doc_bytes {
                    let mut end = self.max_doc_bytes;
                    while end > 0 && !text.is_char_boundary(end) {
                        end -= 1;
                    }
                    &text[..end]
                } else {
                    text
                };
                analyze(capped)
            }
            None => Vec::new(),
        };

        let mut term_names: Vec<String> = Vec::new();
        for token in &path_tokens {
            let postings = live
                .terms
                .entry(token.text.clone())
                .or_default()
                .entry(doc_id.clone())
                .or_default();
            let field = postings.path.get_or_insert_with(FieldPostings::default);
            field.positions.push(token.position);
            field.offsets.push(token.byte_start);
            term_names.push(token.text.clone());
        }
        for token in &body_tokens {
            let postings = live
                .terms
                .entry(token.text.clone())
                .or_default()
                .entry(doc_id.clone())
                .or_default();
            let field = postings.body.get_or_insert_with(FieldPostings::default);
            field.positions.push(token.position);
            field.offsets.push(token.byte_start);
            term_names.push(token.text.clone());
        }
        term_names.sort_unstable();
        term_names.dedup();

        live.total_body_tokens += body_tokens.len() as u64;
        live.docs.insert(
            doc_id.clone(),
            DocMeta {
                rel_path: doc_id.rel_path().to_string(),
                repo: doc_id.repo().to_string(),
                mtime,
                size,
                has_body: body.is_some(),
                body_tokens: body_tokens.len() as u32,
            },
        );
        live.doc_terms.insert(doc_id.clone(), term_names);
        live.seq += 1;
    }

    /// Remove one document. Idempotent.
    pub fn delete(&self, doc_id: &DocId) {
        let mut live = self.live.write();
        if Self::remove_doc(&mut live, doc_id) {
            live.seq += 1;
        }
    }

    fn remove_doc(live: &mut Segment, doc_id: &DocId) -> bool {
        let Some(meta) = live.docs.remove(doc_id) else {
            return false;
        };
        live.total_body_tokens = live.total_body_tokens.saturating_sub(meta.body_tokens as u64);
        if let Some(terms) = live.doc_terms.remove(doc_id) {
            for term in terms {
                if let Some(postings) = live.terms.get_mut(&term) {
                    postings.remove(doc_id);
                    if postings.is_empty() {
                        live.terms.remove(&term);
                    }
                }
            }
        }
        true
    }

    /// Persist the live segment (atomic rename). Called by the orchestrator
    /// after commit batches and at shutdown.
    pub fn save(&self) -> Result<()> {
        let serialized = {
            let live = self.live.read();
            serde_json::to_vec(&*live).context("failed to serialize text index segment")?
        };
        let path = self.dir.join("segment.json");
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &serialized)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to publish {}", path.display()))?;
        Ok(())
    }

    // ---- Read side ----

    /// Refresh the reader snapshot if writes happened since the last one.
    /// Returns true when a new snapshot was published.
    pub fn reload_reader(&self) -> bool {
        let live_seq = self.live.read().seq;
        if self.snapshot.read().segment.seq == live_seq {
            return false;
        }
        let cloned = self.live.read().clone();
        *self.snapshot.write() = Arc::new(Snapshot { segment: cloned });
        *self.snapshot_taken.write() = std::time::Instant::now();
        true
    }

    /// The current reader snapshot. Queries against one snapshot are
    /// stable: writes after snapshot time are invisible until reload.
    pub fn reader(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    /// Spawn the background reload task.
    pub fn spawn_reader_reload(
        self: &Arc<Self>,
        reload_ms: u64,
    ) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(reload_ms.max(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                engine.reload_reader();
            }
        })
    }

    pub fn status(&self) -> EngineStatus {
        let snapshot = self.reader();
        EngineStatus {
            doc_count: snapshot.doc_count(),
            index_version: snapshot.index_version(),
            snapshot_age_ms: self.snapshot_taken.read().elapsed().as_millis() as u64,
            available: self.availability().is_none(),
            unavailable_reason: self.availability(),
        }
    }

    /// Live doc count (not snapshot), for verify drift checks.
    pub fn live_doc_count(&self) -> usize {
        self.live.read().docs.len()
    }

    /// Drop all postings ahead of a rebuild.
    pub fn clear(&self) {
        let mut live = self.live.write();
        let config_hash = live.config_hash.clone();
        let seq = live.seq + 1;
        *live = Segment {
            seq,
            config_hash,
            ..Segment::default()
        };
    }
}

impl Snapshot {
    pub fn doc_count(&self) -> usize {
        self.segment.docs.len()
    }

    /// Snapshot identifier: commit seq + config hash. Identical queries
    /// against one snapshot return the same version string.
    pub fn index_version(&self) -> String {
        format!("{}-{}", self.segment.seq, self.segment.config_hash)
    }

    pub fn doc_meta(&self, doc_id: &DocId) -> Option<&DocMeta> {
        self.segment.docs.get(doc_id)
    }

    /// Evaluate a query against this snapshot. Returns every matching doc
    /// with its base score; filtering, multipliers, and pagination happen
    /// in the search engine.
    pub fn query(&self, query: &str) -> Vec<TextHit> {
        let terms = parse_query(query);
        if terms.is_empty() {
            return Vec::new();
        }

        // AND semantics: start from the rarest term's posting list.
        let mut candidates: Option<Vec<&DocId>> = None;
        for term in &terms {
            let docs: Vec<&DocId> = match term {
                QueryTerm::Token(token) => self
                    .segment
                    .terms
                    .get(token)
                    .map(|postings| postings.keys().collect())
                    .unwrap_or_default(),
                QueryTerm::Phrase(tokens) => {
                    // A phrase candidate must carry every constituent token.
                    let mut iter = tokens.iter();
                    let Some(first) = iter.next() else { continue };
                    let mut docs: Vec<&DocId> = self
                        .segment
                        .terms
                        .get(first)
                        .map(|postings| postings.keys().collect())
                        .unwrap_or_default();
                    for token in iter {
                        let Some(postings) = self.segment.terms.get(token) else {
                            docs.clear();
                            break;
                        };
                        docs.retain(|doc| postings.contains_key(*doc));
                    }
                    docs
                }
            };
            candidates = Some(match candidates {
                None => docs,
                Some(existing) => {
                    let keep: std::collections::HashSet<&DocId> = docs.into_iter().collect();
                    existing.into_iter().filter(|d| keep.contains(*d)).collect()
                }
            });
            if candidates.as_ref().is_some_and(|c| c.is_empty()) {
                return Vec::new();
            }
        }

        let candidates = candidates.unwrap_or_default();
        let doc_count = self.segment.docs.len() as f64;
        let avg_body_len = if self.segment.docs.is_empty() {
            1.0
        } else {
            (self.segment.total_body_tokens as f64 / self.segment.docs.len() as f64).max(1.0)
        };

        let mut hits = Vec::with_capacity(candidates.len());
        'candidates: for doc_id in candidates {
            let Some(meta) = self.segment.docs.get(doc_id) else {
                continue;
            };
            let mut score = 0.0;
            let mut match_count = 0usize;
            let mut first_offset: Option<u32> = None;
            let mut any_body = false;

            for term in &terms {
                match term {
                    QueryTerm::Token(token) => {
                        let Some(postings) =
                            self.segment.terms.get(token).and_then(|p| p.get(doc_id))
                        else {
                            continue 'candidates;
                        };
                        let body_tf = postings.body.as_ref().map_or(0, |f| f.positions.len());
                        let path_tf = postings.path.as_ref().map_or(0, |f| f.positions.len());
                        if body_tf == 0 && path_tf == 0 {
                            continue 'candidates;
                        }
                        let df = self.segment.terms.get(token).map_or(1, BTreeMap::len) as f64;
                        score += bm25_term(
                            body_tf as f64 + PATH_WEIGHT * path_tf as f64,
                            df,
                            doc_count,
                            meta.body_tokens as f64,
                            avg_body_len,
                        );
                        match_count += body_tf + path_tf;
                        if body_tf > 0 {
                            any_body = true;
                            let offset = postings.body.as_ref().and_then(|f| f.offsets.first());
                            first_offset = match (first_offset, offset) {
                                (None, Some(&o)) => Some(o),
                                (Some(current), Some(&o)) => Some(current.min(o)),
                                (current, None) => current,
                            };
                        }
                    }
                    QueryTerm::Phrase(tokens) => {
                        let Some((occurrences, offset)) = self.phrase_matches(doc_id, tokens)
                        else {
                            continue 'candidates;
                        };
                        let df = self
                            .segment
                            .terms
                            .get(&tokens[0])
                            .map_or(1, BTreeMap::len) as f64;
                        score += bm25_term(
                            occurrences as f64,
                            df,
                            doc_count,
                            meta.body_tokens as f64,
                            avg_body_len,
                        ) * tokens.len() as f64;
                        match_count += occurrences;
                        if let Some(offset) = offset {
                            any_body = true;
                            first_offset = match first_offset {
                                None => Some(offset),
                                Some(current) => Some(current.min(offset)),
                            };
                        }
                    }
                }
            }

            let exact_match = self.all_tokens_adjacent(doc_id, &terms);
            hits.push(TextHit {
                doc_id: doc_id.clone(),
                score,
                match_count,
                mtime: meta.mtime,
                size: meta.size,
                first_offset,
                exact_match,
                path_only: !any_body,
            });
        }
        hits
    }

    /// Count phrase occurrences in one doc; returns (count, first body
    /// offset). Positions must be consecutive within a single field.
    fn phrase_matches(&self, doc_id: &DocId, tokens: &[String]) -> Option<(usize, Option<u32>)> {
        let fields: Vec<&DocPostings> = tokens
            .iter()
            .map(|t| self.segment.terms.get(t).and_then(|p| p.get(doc_id)))
            .collect::<Option<Vec<_>>>()?;

        let count_in =
            |select: fn(&DocPostings) -> Option<&FieldPostings>| -> (usize, Option<u32>) {
                let Some(first) = select(fields[0]) else {
                    return (0, None);
                };
                let mut count = 0usize;
                let mut first_offset = None;
                'starts: for (idx, &start) in first.positions.iter().enumerate() {
                    for (step, field) in fields.iter().enumerate().skip(1) {
                        let Some(postings) = select(*field) else {
                            return (0, None);
                        };
                        if !postings.positions.contains(&(start + step as u32)) {
                            continue 'starts;
                        }
                    }
                    count += 1;
                    if first_offset.is_none() {
                        first_offset = first.offsets.get(idx).copied();
                    }
                }
                (count, first_offset)
            };

        let (body_count, body_offset) = count_in(|p| p.body.as_ref());
        let (path_count, _) = count_in(|p| p.path.as_ref());
        let total = body_count + path_count;
        if total == 0 {
            return None;
        }
        Some((total, if body_count > 0 { body_offset } else { None }))
    }

    /// Exact-token bonus condition: every query token appears and the whole
    /// token sequence occurs consecutively somewhere in the body.
    fn all_tokens_adjacent(&self, doc_id: &DocId, terms: &[QueryTerm]) -> bool {
        let flat: Vec<String> = terms
            .iter()
            .flat_map(|t| match t {
                QueryTerm::Token(token) => vec![token.clone()],
                QueryTerm::Phrase(tokens) => tokens.clone(),
            })
            .collect();
        if flat.is_empty() {
            return false;
        }
        if flat.len() == 1 {
            // Single token: exact when it matched the body at all.
            return self
                .segment
                .terms
                .get(&flat[0])
                .and_then(|p| p.get(doc_id))
                .and_then(|p| p.body.as_ref())
                .is_some();
        }
        self.phrase_matches(doc_id, &flat)
            .map(|(count, offset)| count > 0 && offset.is_some())
            .unwrap_or(false)
    }
}

fn bm25_term(tf: f64, df: f64, doc_count: f64, body_len: f64, avg_len: f64) -> f64 {
    if tf <= 0.0 {
        return 0.0;
    }
    let idf = ((doc_count - df + 0.5) / (df + 0.5) + 1.0).ln();
    let norm = tf * (K1 + 1.0) / (tf + K1 * (1.0 - B + B * body_len.max(1.0) / avg_len));
    idf.max(0.01) * norm
}
