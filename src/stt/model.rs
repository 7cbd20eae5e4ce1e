//! Whisper model management
//!
//! Models are fetched from content-addressed URLs into `<name>.tmp` and
//! renamed into place only after the byte length matches the published
//! size, so a crashed download never leaves a half model behind.

use anyhow::{anyhow, bail, Context, Result};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// Catalogue entry for a downloadable model.
#[derive(Debug, Clone, Copy)]
pub struct ModelSpec {
    pub size: &'static str,
    pub filename: &'static str,
    pub url: &'static str,
    /// Published byte length, checked after download.
    pub expected_bytes: u64,
}

/// The three sizes the service supports.
pub const MODEL_CATALOGUE: &[ModelSpec] = &[
    ModelSpec {
        size: "tiny",
        filename: "ggml-tiny.bin",
        url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-tiny.bin",
        expected_bytes: 77_691_713,
    },
    ModelSpec {
        size: "base",
        filename: "ggml-base.bin",
        url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-base.bin",
        expected_bytes: 147_951_465,
    },
    ModelSpec {
        size: "small",
        filename: "ggml-small.bin",
        url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-small.bin",
        expected_bytes: 487_601_967,
    },
];

pub fn model_spec(size: &str) -> Option<&'static ModelSpec> {
    MODEL_CATALOGUE.iter().find(|m| m.size == size)
}

/// Status row for the admin models endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelStatus {
    pub size: String,
    pub filename: String,
    pub present: bool,
    pub bytes_on_disk: Option<u64>,
    pub expected_bytes: u64,
}

pub struct ModelManager {
    models_dir: PathBuf,
    http: reqwest::Client,
}

impl ModelManager {
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

    pub fn model_path(&self, spec: &ModelSpec) -> PathBuf {
        self.models_dir.join(spec.filename)
    }

    pub fn list(&self) -> Vec<ModelStatus> {
        MODEL_CATALOGUE
            .iter()
            .map(|spec| {
                let path = self.model_path(spec);
                let bytes = std::fs::metadata(&path).map(|m| m.len()).ok();
                ModelStatus {
                    size: spec.size.to_string(),
                    filename: spec.filename.to_string(),
                    present: bytes.is_some(),
                    bytes_on_disk: bytes,
                    expected_bytes: spec.expected_bytes,
                }
            })
            .collect()
    }

    /// Return the on-disk path for `size`, downloading first if needed.
    pub async fn ensure_model(&self, size: &str) -> Result<PathBuf> {
        let spec = model_spec(size).ok_or_else(|| anyhow!("unknown model size: {}", size))?;
        let path = self.model_path(spec);
        if path.exists() {
            return Ok(path);
        }
        self.download(spec).await?;
        Ok(path)
    }

    /// Stream the model into `<file>.tmp`, verify its length, then rename
    /// atomically.
    pub async fn download(&self, spec: &ModelSpec) -> Result<PathBuf> {
        let final_path = self.model_path(spec);
        let tmp_path = self.models_dir.join(format!("{}.tmp", spec.filename));

        tracing::info!(model = spec.size, url = spec.url, "Downloading STT model");

        let response = self
            .http
            .get(spec.url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", spec.url))?;
        if !response.status().is_success() {
            bail!("model download answered {}", response.status());
        }

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

        if written != spec.expected_bytes {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            bail!(
                "model {} size mismatch: expected {} bytes, got {}",
                spec.size,
                spec.expected_bytes,
                written
            );
        }

        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .with_context(|| format!("Failed to move model into {}", final_path.display()))?;

        tracing::info!(
            model = spec.size,
            bytes = written,
            sha256 = %format!("{:x}", hasher.finalize()),
            "STT model downloaded"
        );
        Ok(final_path)
    }

    pub fn delete(&self, size: &str) -> Result<bool> {
        let spec = model_spec(size).ok_or_else(|| anyhow!("unknown model size: {}", size))?;
        let path = self.model_path(spec);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)
            .with_context(|| format!("Failed to delete {}", path.display()))?;
        Ok(true)
    }
}
