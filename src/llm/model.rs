//! LLM model management
//!
//! GGUF models are fetched the same way whisper models are: streamed
//! into `<name>.tmp` and renamed into place only after verification, so
//! a crashed download never leaves a half model behind. Hand-placed
//! `.gguf` files in the models directory are listed alongside the
//! catalogue so operators can bring their own.

use anyhow::{anyhow, bail, Context, Result};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// Catalogue entry for a downloadable chat model. GGUF blobs have no
/// published byte length the way whisper models do, so downloads are
/// verified against the server's Content-Length instead.
#[derive(Debug, Clone, Copy)]
pub struct LlmModelSpec {
    pub name: &'static str,
    pub filename: &'static str,
    pub url: &'static str,
}

/// Small instruct models that fit the extractor's latency budget on CPU.
pub const LLM_MODEL_CATALOGUE: &[LlmModelSpec] = &[
    LlmModelSpec {
        name: "qwen2.5-3b",
        filename: "qwen2.5-3b-instruct-q4_k_m.gguf",
        url: "https://huggingface.co/Qwen/Qwen2.5-3B-Instruct-GGUF/resolve/main/qwen2.5-3b-instruct-q4_k_m.gguf",
    },
    LlmModelSpec {
        name: "llama3.2-3b",
        filename: "Llama-3.2-3B-Instruct-Q4_K_M.gguf",
        url: "https://huggingface.co/bartowski/Llama-3.2-3B-Instruct-GGUF/resolve/main/Llama-3.2-3B-Instruct-Q4_K_M.gguf",
    },
    LlmModelSpec {
        name: "phi3-mini",
        filename: "Phi-3-mini-4k-instruct-q4.gguf",
        url: "https://huggingface.co/microsoft/Phi-3-mini-4k-instruct-gguf/resolve/main/Phi-3-mini-4k-instruct-q4.gguf",
    },
];

pub fn llm_model_spec(name: &str) -> Option<&'static LlmModelSpec> {
    LLM_MODEL_CATALOGUE.iter().find(|m| m.name == name)
}

/// Status row for the admin LLM models endpoint. `name` is the
/// catalogue key; hand-placed files carry only their filename.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LlmModelStatus {
    pub name: Option<String>,
    pub filename: String,
    pub present: bool,
    pub bytes_on_disk: Option<u64>,
}

pub struct LlmModelManager {
    models_dir: PathBuf,
    http: reqwest::Client,
}

impl LlmModelManager {
    pub fn new(models_dir: impl Into<PathBuf>) -> Result<Self> {
        let models_dir = models_dir.into();
        std::fs::create_dir_all(&models_dir)
            .with_context(|| format!("Failed to create {}", models_dir.display()))?;
        // Content-addressed hosts answer with one redirect to the blob
        // store; anything beyond that is unexpected.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(1))
            .build()
            .context("Failed to create download client")?;
        Ok(Self { models_dir, http })
    }

    pub fn model_path(&self, filename: &str) -> PathBuf {
        self.models_dir.join(filename)
    }

    /// Catalogue models plus any other `.gguf` files already on disk.
    pub fn list(&self) -> Vec<LlmModelStatus> {
        let mut out: Vec<LlmModelStatus> = LLM_MODEL_CATALOGUE
            .iter()
            .map(|spec| {
                let bytes = std::fs::metadata(self.model_path(spec.filename))
                    .map(|m| m.len())
                    .ok();
                LlmModelStatus {
                    name: Some(spec.name.to_string()),
                    filename: spec.filename.to_string(),
                    present: bytes.is_some(),
                    bytes_on_disk: bytes,
                }
            })
            .collect();

        if let Ok(entries) = std::fs::read_dir(&self.models_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().map(|e| e == "gguf") != Some(true) {
                    continue;
                }
                let filename = entry.file_name().to_string_lossy().into_owned();
                if LLM_MODEL_CATALOGUE.iter().any(|s| s.filename == filename) {
                    continue;
                }
                out.push(LlmModelStatus {
                    name: None,
                    filename,
                    present: true,
                    bytes_on_disk: entry.metadata().map(|m| m.len()).ok(),
                });
            }
        }
        out
    }

    /// Return the on-disk path for a catalogue model, downloading first
    /// if needed.
    pub async fn ensure_model(&self, name: &str) -> Result<PathBuf> {
        let spec =
            llm_model_spec(name).ok_or_else(|| anyhow!("unknown LLM model: {}", name))?;
        let path = self.model_path(spec.filename);
        if path.exists() {
            return Ok(path);
        }
        self.download(spec).await?;
        Ok(path)
    }

    /// Stream the model into `<file>.tmp`, verify its length against the
    /// server's Content-Length, then rename atomically.
    pub async fn download(&self, spec: &LlmModelSpec) -> Result<PathBuf> {
        let final_path = self.model_path(spec.filename);
        let tmp_path = self.models_dir.join(format!("{}.tmp", spec.filename));

        tracing::info!(model = spec.name, url = spec.url, "Downloading LLM model");

        let response = self
            .http
            .get(spec.url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", spec.url))?;
        if !response.status().is_success() {
            bail!("model download answered {}", response.status());
        }
        let expected_bytes = response.content_length();

        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("model download interrupted")?;
            hasher.update(&chunk);
            written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        if let Some(expected) = expected_bytes {
            if written != expected {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                bail!(
                    "model {} size mismatch: expected {} bytes, got {}",
                    spec.name,
                    expected,
                    written
                );
            }
        }

        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .with_context(|| format!("Failed to move model into {}", final_path.display()))?;

        tracing::info!(
            model = spec.name,
            bytes = written,
            sha256 = %format!("{:x}", hasher.finalize()),
            "LLM model downloaded"
        );
        Ok(final_path)
    }

    /// Delete a model by catalogue name or bare filename.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let filename = match llm_model_spec(name) {
            Some(spec) => spec.filename.to_string(),
            None => {
                // Hand-placed file: the name is the filename, kept to a
                // bare .gguf basename so it cannot escape the directory.
                if name.contains('/') || name.contains('\\') || !name.ends_with(".gguf") {
                    bail!("unknown LLM model: {}", name);
                }
                name.to_string()
            }
        };
        let path = self.model_path(&filename);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)
            .with_context(|| format!("Failed to delete {}", path.display()))?;
        Ok(true)
    }
}
