//! Chunk vectorization and per-project vector index rebuilds

use crate::store::IndexStore;
use quarry_core::config::VectorizeConfig;
use quarry_core::{FlatVectorIndex, QuarryError, Result, VectorIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Text embedding service
pub trait EmbeddingProvider: Send + Sync {
    fn model(&self) -> &str;

    fn dimension(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

/// `POST {url}` with `{model, input}`, answered by `{embedding: [f32]}`.
pub struct HttpEmbeddingProvider {
    url: String,
    model: String,
    dimension: usize,
    http: reqwest::blocking::Client,
}

impl HttpEmbeddingProvider {
    pub fn from_config(config: &VectorizeConfig) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| QuarryError::Embedding(e.to_string()))?;
        Ok(Self {
            url: config.embedding_url.clone(),
            model: config.model.clone(),
            dimension: config.dimension,
            http,
        })
    }
}

impl EmbeddingProvider for HttpEmbeddingProvider {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let resp = self
            .http
            .post(&self.url)
            .json(&EmbedRequest {
                model: &self.model,
                input: text,
            })
            .send()
            .map_err(|e| QuarryError::Embedding(format!("{}: {e}", self.url)))?;
        if !resp.status().is_success() {
            return Err(QuarryError::Embedding(format!(
                "{} returned HTTP {}",
                self.url,
                resp.status()
            )));
        }
        let body: EmbedResponse = resp
            .json()
            .map_err(|e| QuarryError::Embedding(format!("bad response: {e}")))?;
        if body.embedding.len() != self.dimension {
            return Err(QuarryError::Embedding(format!(
                "expected dimension {}, got {}",
                self.dimension,
                body.embedding.len()
            )));
        }
        Ok(body.embedding)
    }
}

/// Result of one vectorization pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VectorizeReport {
    pub chunks_embedded: usize,
    pub embedding_failures: usize,
    pub projects_rebuilt: Vec<String>,
}

pub struct Vectorizer<'a> {
    store: IndexStore<'a>,
    provider: &'a dyn EmbeddingProvider,
    vectors_dir: PathBuf,
    batch_size: usize,
    max_attempts: u32,
    rebuild_interval: Duration,
    last_rebuild: HashMap<String, Instant>,
}

impl<'a> Vectorizer<'a> {
    pub fn new(
        store: IndexStore<'a>,
        provider: &'a dyn EmbeddingProvider,
        vectors_dir: &Path,
        config: &VectorizeConfig,
    ) -> Self {
        Self {
            store,
            provider,
            vectors_dir: vectors_dir.to_path_buf(),
            batch_size: config.batch_size.max(1),
            max_attempts: config.max_embedding_attempts.max(1),
            rebuild_interval: config.rebuild_interval(),
            last_rebuild: HashMap::new(),
        }
    }

    pub fn index_path(&self, project_id: &str) -> PathBuf {
        self.vectors_dir.join(format!("{project_id}.json"))
    }

    /// Embed one batch per project, largest backlog first, and rebuild the
    /// indexes that changed or are due.
    pub fn run_pass(&mut self) -> Result<VectorizeReport> {
        let mut report = VectorizeReport::default();
        let mut project_ids: Vec<String> = self
            .store
            .pending_chunk_counts(self.max_attempts)?
            .into_iter()
            .map(|(project_id, _)| project_id)
            .collect();
        for project in self.store.list_projects()? {
            if !project_ids.contains(&project.id) {
                project_ids.push(project.id);
            }
        }

        for project_id in project_ids {
            let embedded = self.embed_pending(&project_id, &mut report)?;
            let due = self
                .last_rebuild
                .get(&project_id)
                .map_or(true, |at| at.elapsed() >= self.rebuild_interval);
            if embedded > 0 || due {
                self.rebuild(&project_id)?;
                report.projects_rebuilt.push(project_id);
            }
        }
        Ok(report)
    }

    fn embed_pending(&self, project_id: &str, report: &mut VectorizeReport) -> Result<usize> {
        let pending = self
            .store
            .pending_chunks(project_id, self.batch_size, self.max_attempts)?;
        if pending.is_empty() {
            return Ok(0);
        }
        let mut embeddings = Vec::with_capacity(pending.len());
        let mut failed = Vec::new();
        for chunk in &pending {
            match self.provider.embed(&chunk.text) {
                Ok(vector) => embeddings.push((chunk.id, vector)),
                Err(err) => {
                    tracing::warn!(chunk = chunk.id, error = %err, "embedding failed");
                    failed.push(chunk.id);
                }
            }
        }
        report.embedding_failures += failed.len();
        self.store.record_embedding_failures(&failed)?;
        self.store.set_chunk_embeddings(&embeddings, self.provider.model())?;
        report.chunks_embedded += embeddings.len();
        tracing::debug!(project = %project_id, embedded = embeddings.len(), "chunks embedded");
        Ok(embeddings.len())
    }

    /// Renumber vector ids densely and save a fresh index for the project.
    pub fn rebuild(&mut self, project_id: &str) -> Result<FlatVectorIndex> {
        let dimension = self.provider.dimension();
        let vectors = self.store.rebuild_vector_ids(project_id, dimension)?;
        let mut index = FlatVectorIndex::new(dimension);
        index.rebuild(vectors)?;
        index.save(&self.index_path(project_id))?;
        self.last_rebuild.insert(project_id.to_string(), Instant::now());
        tracing::info!(project = %project_id, vectors = index.len(), "vector index rebuilt");
        Ok(index)
    }

    pub fn run(&mut self, shutdown: &crate::shutdown::ShutdownFlag, poll_interval: Duration) {
        tracing::info!(model = %self.provider.model(), "vectorizer running");
        loop {
            match self.run_pass() {
                Ok(report) if report.chunks_embedded > 0 || report.embedding_failures > 0 => tracing::info!(
                    embedded = report.chunks_embedded,
                    failures = report.embedding_failures,
                    rebuilt = report.projects_rebuilt.len(),
                    "vectorize pass complete"
                ),
                Ok(_) => {}
                Err(err) => tracing::error!(error = %err, "vectorize pass failed"),
            }
            if !shutdown.sleep(poll_interval) {
                break;
            }
        }
        tracing::info!("vectorizer stopped");
    }

    /// Nearest chunks to `query` in the saved index of `project_id`.
    pub fn search(&self, project_id: &str, query: &str, k: usize) -> Result<Vec<SearchResult>> {
        let index = FlatVectorIndex::load(&self.index_path(project_id))?;
        let embedding = self.provider.embed(query)?;
        let mut results = Vec::new();
        for hit in index.search(&embedding, k) {
            if let Some((path, text, line)) = self.store.chunk_text_for_vector(project_id, hit.vector_id)? {
                results.push(SearchResult {
                    vector_id: hit.vector_id,
                    score: hit.score,
                    path,
                    line,
                    text,
                });
            }
        }
        Ok(results)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub vector_id: i64,
    pub score: f32,
    pub path: String,
    pub line: i64,
    pub text: String,
}
