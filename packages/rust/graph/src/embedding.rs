//! Text embedding service.
//!
//! [`EmbeddingService`] owns an [`EmbeddingConfig`] and loads the backend
//! model lazily on first use. Backends implement [`EmbeddingModel`]:
//! - [`HashingEmbedder`]: offline, deterministic feature hashing
//! - [`OllamaEmbedder`]: Ollama `/api/embed`
//! - [`OpenAiEmbedder`]: OpenAI-compatible `/v1/embeddings`

use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use treeward_shared::{
    DEFAULT_HASHING_DIMENSION, EmbeddingConfig, EmbeddingProvider, Result, TreewardError,
    validate_embeddings,
};

/// A loaded text-embedding model.
pub trait EmbeddingModel: Send {
    /// Vector length produced by this model.
    fn dimension(&self) -> usize;

    /// Embed every text, returning one vector per input in input order.
    fn encode(&mut self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;
}

/// Builds a model from configuration. Called at most once per successful load.
pub type ModelLoader =
    Box<dyn FnMut(&EmbeddingConfig) -> Result<Box<dyn EmbeddingModel>> + Send>;

// ---------------------------------------------------------------------------
// EmbeddingService
// ---------------------------------------------------------------------------

/// Turns text into fixed-length vectors, loading the model on first use.
pub struct EmbeddingService {
    config: EmbeddingConfig,
    loader: ModelLoader,
    model: Option<Box<dyn EmbeddingModel>>,
}

impl EmbeddingService {
    /// Create a service for the configured provider. Nothing is loaded yet.
    pub fn new(config: EmbeddingConfig) -> Self {
        Self::with_loader(config, Box::new(load_model))
    }

    /// Create a service with a custom model loader.
    pub fn with_loader(config: EmbeddingConfig, loader: ModelLoader) -> Self {
        Self {
            config,
            loader,
            model: None,
        }
    }

    /// Identifier of the model, as recorded in technique graphs.
    pub fn model_name(&self) -> &str {
        &self.config.model
    }

    /// Whether the backend model has been loaded.
    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Vector length of the model. Loads the model but embeds nothing.
    pub fn dimension(&mut self) -> Result<usize> {
        Ok(self.model()?.dimension())
    }

    /// Embed a single text. Empty input yields an empty vector.
    pub fn embed(&mut self, text: &str) -> Result<Vec<f32>> {
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let mut vectors = self.encode_chunk(&[text])?;
        vectors
            .pop()
            .ok_or_else(|| TreewardError::Model("model returned no vector".into()))
    }

    /// Embed many texts, preserving input order. Empty texts yield empty vectors.
    pub fn embed_batch(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out: Vec<Vec<f32>> = vec![Vec::new(); texts.len()];

        let pending: Vec<usize> = texts
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.is_empty())
            .map(|(i, _)| i)
            .collect();

        if pending.is_empty() {
            return Ok(out);
        }

        debug!(count = pending.len(), model = %self.config.model, "embedding batch");

        let batch_size = self.config.batch_size.max(1);
        for chunk in pending.chunks(batch_size) {
            let inputs: Vec<&str> = chunk.iter().map(|&i| texts[i].as_str()).collect();
            let vectors = self.encode_chunk(&inputs)?;
            for (&i, vector) in chunk.iter().zip(vectors) {
                out[i] = vector;
            }
        }

        Ok(out)
    }

    /// Run the model over one chunk and check the output shape. Any failure
    /// unloads the model so the next call starts from a fresh load.
    fn encode_chunk(&mut self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        let result = {
            let model = self.model()?;
            let dim = model.dimension();
            model
                .encode(inputs)
                .and_then(|vectors| check_shape(vectors, inputs.len(), dim))
        };

        if let Err(e) = &result {
            warn!(model = %self.config.model, error = %e, "embedding failed, unloading model");
            self.model = None;
        }

        result
    }

    /// Initialize-or-return accessor for the backend model.
    fn model(&mut self) -> Result<&mut Box<dyn EmbeddingModel>> {
        if self.model.is_none() {
            info!(provider = ?self.config.provider, model = %self.config.model, "loading embedding model");
            let loaded = (self.loader)(&self.config)?;
            info!(dimension = loaded.dimension(), "embedding model loaded");
            self.model = Some(loaded);
        }
        self.model
            .as_mut()
            .ok_or_else(|| TreewardError::Model("embedding model unavailable".into()))
    }
}

fn check_shape(vectors: Vec<Vec<f32>>, expected: usize, dim: usize) -> Result<Vec<Vec<f32>>> {
    if vectors.len() != expected {
        return Err(TreewardError::Model(format!(
            "model returned {} vectors for {expected} inputs",
            vectors.len()
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dim) {
        return Err(TreewardError::Model(format!(
            "model returned a vector of length {} (expected {dim})",
            bad.len()
        )));
    }
    Ok(vectors)
}

/// Default loader: build the backend named by `config.provider`.
pub fn load_model(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingModel>> {
    validate_embeddings(config)?;

    match config.provider {
        EmbeddingProvider::Hashing => Ok(Box::new(HashingEmbedder::new(
            config.dimension.unwrap_or(DEFAULT_HASHING_DIMENSION),
        ))),
        EmbeddingProvider::Ollama => Ok(Box::new(OllamaEmbedder::new(config)?)),
        EmbeddingProvider::OpenAi => Ok(Box::new(OpenAiEmbedder::new(config)?)),
    }
}

// ---------------------------------------------------------------------------
// Hashing backend
// ---------------------------------------------------------------------------

/// Offline embedder: signed feature hashing of word unigrams and bigrams.
///
/// Texts sharing vocabulary land close together; it has no notion of
/// synonyms, but it is deterministic across runs and platforms.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        let lower = text.to_lowercase();
        let tokens: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();

        for token in &tokens {
            self.add_feature(&mut vector, token, 1.0);
        }
        for pair in tokens.windows(2) {
            self.add_feature(&mut vector, &format!("{} {}", pair[0], pair[1]), 0.5);
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut index_bytes = [0u8; 8];
        index_bytes.copy_from_slice(&digest[..8]);
        let index = (u64::from_le_bytes(index_bytes) % self.dim as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign * weight;
    }
}

impl EmbeddingModel for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dim
    }

    fn encode(&mut self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ---------------------------------------------------------------------------
// HTTP backends
// ---------------------------------------------------------------------------

fn http_client(timeout: Duration) -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .user_agent(concat!("Treeward/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
        .map_err(|e| TreewardError::Model(format!("client build: {e}")))
}

fn required_dimension(config: &EmbeddingConfig) -> Result<usize> {
    config
        .dimension
        .filter(|d| *d > 0)
        .ok_or_else(|| TreewardError::config("embeddings.dimension is required for HTTP providers"))
}

/// Embeddings served by an Ollama instance.
pub struct OllamaEmbedder {
    client: reqwest::blocking::Client,
    url: String,
    model: String,
    dim: usize,
}

#[derive(serde::Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(serde::Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(Duration::from_secs(120))?,
            url: format!("{}/api/embed", config.endpoint.trim_end_matches('/')),
            model: config.model.clone(),
            dim: required_dimension(config)?,
        })
    }
}

impl EmbeddingModel for OllamaEmbedder {
    fn dimension(&self) -> usize {
        self.dim
    }

    fn encode(&mut self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let request = EmbedRequest {
            model: &self.model,
            input: texts,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .map_err(|e| TreewardError::Model(format!("{}: {e}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TreewardError::Model(format!("{}: HTTP {status}", self.url)));
        }

        let body: OllamaEmbedResponse = response
            .json()
            .map_err(|e| TreewardError::Model(format!("invalid embed response: {e}")))?;
        Ok(body.embeddings)
    }
}

/// Embeddings served by an OpenAI-compatible API.
pub struct OpenAiEmbedder {
    client: reqwest::blocking::Client,
    url: String,
    model: String,
    api_key: String,
    dim: usize,
}

#[derive(serde::Deserialize)]
struct OpenAiEmbedResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(serde::Deserialize)]
struct OpenAiEmbedding {
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            TreewardError::config(format!(
                "embedding API key not found. Set the {} environment variable.",
                config.api_key_env
            ))
        })?;

        Ok(Self {
            client: http_client(Duration::from_secs(60))?,
            url: format!("{}/v1/embeddings", config.endpoint.trim_end_matches('/')),
            model: config.model.clone(),
            api_key,
            dim: required_dimension(config)?,
        })
    }
}

impl EmbeddingModel for OpenAiEmbedder {
    fn dimension(&self) -> usize {
        self.dim
    }

    fn encode(&mut self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let request = EmbedRequest {
            model: &self.model,
            input: texts,
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .map_err(|e| TreewardError::Model(format!("{}: {e}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TreewardError::Model(format!("{}: HTTP {status}", self.url)));
        }

        let mut body: OpenAiEmbedResponse = response
            .json()
            .map_err(|e| TreewardError::Model(format!("invalid embed response: {e}")))?;
        body.data.sort_by_key(|d| d.index);
        Ok(body.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn hashing_config(dim: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            model: format!("hashing-{dim}"),
            dimension: Some(dim),
            batch_size: 2,
            ..Default::default()
        }
    }

    /// Fails on the first `fail_calls` encode calls, then behaves like hashing.
    struct FlakyModel {
        inner: HashingEmbedder,
        fail_calls: Arc<AtomicUsize>,
    }

    impl EmbeddingModel for FlakyModel {
        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn encode(&mut self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
            if self.fail_calls.load(Ordering::SeqCst) > 0 {
                self.fail_calls.fetch_sub(1, Ordering::SeqCst);
                return Err(TreewardError::Model("inference failed".into()));
            }
            self.inner.encode(texts)
        }
    }

    fn counting_service(loads: Arc<AtomicUsize>, fail_calls: usize) -> EmbeddingService {
        let fail = Arc::new(AtomicUsize::new(fail_calls));
        EmbeddingService::with_loader(
            hashing_config(16),
            Box::new(move |config: &EmbeddingConfig| -> Result<Box<dyn EmbeddingModel>> {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(FlakyModel {
                    inner: HashingEmbedder::new(config.dimension.unwrap_or(16)),
                    fail_calls: fail.clone(),
                }))
            }),
        )
    }

    #[test]
    fn hashing_is_deterministic_and_normalized() {
        let mut model = HashingEmbedder::new(64);
        let a = model.encode(&["Exploit public-facing application"]).expect("encode");
        let b = model.encode(&["Exploit public-facing application"]).expect("encode");
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 64);
        let norm: f32 = a[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hashing_no_tokens_gives_zero_vector() {
        let mut model = HashingEmbedder::new(8);
        let v = model.encode(&["!!! ---"]).expect("encode");
        assert!(v[0].iter().all(|x| *x == 0.0));
    }

    #[test]
    fn empty_text_does_not_load_model() {
        let loads = Arc::new(AtomicUsize::new(0));
        let mut service = counting_service(loads.clone(), 0);
        assert!(service.embed("").expect("embed").is_empty());
        assert_eq!(loads.load(Ordering::SeqCst), 0);
        assert!(!service.is_loaded());
    }

    #[test]
    fn model_loads_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let mut service = counting_service(loads.clone(), 0);
        assert_eq!(service.dimension().expect("dimension"), 16);
        service.embed("first").expect("embed");
        service.embed("second").expect("embed");
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn batch_preserves_order_and_matches_single_calls() {
        let mut service = EmbeddingService::new(hashing_config(32));
        let texts: Vec<String> = vec![
            "valid accounts".into(),
            String::new(),
            "phishing attachment".into(),
            "cloud storage object discovery".into(),
            "brute force".into(),
        ];
        let batch = service.embed_batch(&texts).expect("batch");
        assert_eq!(batch.len(), texts.len());
        assert!(batch[1].is_empty());
        for (text, vector) in texts.iter().zip(&batch) {
            assert_eq!(&service.embed(text).expect("embed"), vector);
        }
    }

    #[test]
    fn failure_unloads_model() {
        let loads = Arc::new(AtomicUsize::new(0));
        let mut service = counting_service(loads.clone(), 1);

        let err = service.embed("scan buckets").unwrap_err();
        assert!(matches!(err, TreewardError::Model(_)));
        assert!(!service.is_loaded());

        assert_eq!(service.embed("scan buckets").expect("retry").len(), 16);
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn http_provider_without_dimension_fails_to_load() {
        let config = EmbeddingConfig {
            provider: EmbeddingProvider::Ollama,
            model: "nomic-embed-text".into(),
            ..Default::default()
        };
        let mut service = EmbeddingService::new(config);
        assert!(matches!(
            service.dimension().unwrap_err(),
            TreewardError::Config { .. }
        ));
    }
}
