use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use super::audio::WHISPER_SAMPLE_RATE;

/// Available Whisper model sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhisperModel {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl WhisperModel {
    /// Get the Hugging Face URL for this model
    pub fn hf_url(&self) -> &'static str {
        match self {
            WhisperModel::Tiny => "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-tiny.bin",
            WhisperModel::Base => "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-base.bin",
            WhisperModel::Small => "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-small.bin",
            WhisperModel::Medium => "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-medium.bin",
            WhisperModel::Large => "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-large-v3.bin",
        }
    }

    /// Get the filename for this model
    pub fn filename(&self) -> &'static str {
        match self {
            WhisperModel::Tiny => "ggml-tiny.bin",
            WhisperModel::Base => "ggml-base.bin",
            WhisperModel::Small => "ggml-small.bin",
            WhisperModel::Medium => "ggml-medium.bin",
            WhisperModel::Large => "ggml-large-v3.bin",
        }
    }

    /// Get approximate model size in MB
    pub fn size_mb(&self) -> u64 {
        match self {
            WhisperModel::Tiny => 75,
            WhisperModel::Base => 142,
            WhisperModel::Small => 466,
            WhisperModel::Medium => 1500,
            WhisperModel::Large => 3100,
        }
    }
}

impl std::fmt::Display for WhisperModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WhisperModel::Tiny => write!(f, "tiny"),
            WhisperModel::Base => write!(f, "base"),
            WhisperModel::Small => write!(f, "small"),
            WhisperModel::Medium => write!(f, "medium"),
            WhisperModel::Large => write!(f, "large"),
        }
    }
}

impl std::str::FromStr for WhisperModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(WhisperModel::Tiny),
            "base" => Ok(WhisperModel::Base),
            "small" => Ok(WhisperModel::Small),
            "medium" => Ok(WhisperModel::Medium),
            "large" => Ok(WhisperModel::Large),
            _ => Err(format!("Unknown model: {}. Use tiny, base, small, medium, or large", s)),
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to download model: {0}")]
    Download(String),
    #[error("Failed to initialize Whisper: {0}")]
    Init(String),
    #[error("Recognition failed: {0}")]
    Recognition(String),
}

/// Speech recognition seam. Implementations may be slow (seconds per call)
/// and may fail; callers are expected to treat both as routine.
#[async_trait::async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Recognize mono f32 samples at 16 kHz. `chunk_seconds` is a window
    /// length hint; returns the recognized text, possibly empty.
    async fn recognize(&self, samples: Vec<f32>, chunk_seconds: u32) -> Result<String, EngineError>;
}

/// Get the models directory path
pub fn models_dir() -> PathBuf {
    PathBuf::from("models").join("whisper")
}

/// Get the path to a specific model file
pub fn model_path(model: WhisperModel) -> PathBuf {
    models_dir().join(model.filename())
}

/// Check if a model is already downloaded
pub fn is_model_downloaded(model: WhisperModel) -> bool {
    let path = model_path(model);
    if !path.exists() {
        return false;
    }

    // Check if file size is reasonable (at least 50% of expected)
    if let Ok(metadata) = fs::metadata(&path) {
        let expected_bytes = model.size_mb() * 1024 * 1024;
        return metadata.len() >= expected_bytes / 2;
    }

    false
}

/// Download a Whisper model from Hugging Face
pub fn download_model(model: WhisperModel) -> Result<PathBuf, EngineError> {
    let path = model_path(model);

    if is_model_downloaded(model) {
        info!("Model {} already downloaded at {:?}", model, path);
        return Ok(path);
    }

    fs::create_dir_all(models_dir())?;

    info!(
        "Downloading Whisper {} model (~{}MB)...",
        model,
        model.size_mb()
    );

    let url = model.hf_url();

    let response = reqwest::blocking::Client::new()
        .get(url)
        .send()
        .map_err(|e| EngineError::Download(format!("HTTP request failed: {}", e)))?;

    if !response.status().is_success() {
        return Err(EngineError::Download(format!(
            "HTTP {} from {}",
            response.status(),
            url
        )));
    }

    let total_size = response.content_length().unwrap_or(0);

    let pb = indicatif::ProgressBar::new(total_size);
    pb.set_style(
        indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap()
            .progress_chars("#>-"),
    );

    let temp_path = path.with_extension("bin.tmp");
    let mut file = File::create(&temp_path)?;

    let bytes = response
        .bytes()
        .map_err(|e| EngineError::Download(format!("Failed to read response: {}", e)))?;

    file.write_all(&bytes)?;
    pb.set_position(bytes.len() as u64);
    pb.finish_with_message("Download complete");

    fs::rename(&temp_path, &path)?;

    info!("Model downloaded to {:?}", path);

    Ok(path)
}

/// Local whisper.cpp recognizer. The context is loaded once and shared;
/// each call gets its own decode state and runs on the blocking pool so a
/// multi-second inference never stalls a session worker.
pub struct WhisperEngine {
    ctx: Arc<WhisperContext>,
    n_threads: i32,
}

impl WhisperEngine {
    /// Load (downloading the model first if needed). Blocking; call from
    /// `spawn_blocking` in async contexts.
    pub fn load(model: WhisperModel) -> Result<Self, EngineError> {
        let path = download_model(model)?;

        info!("Loading Whisper {} model...", model);

        let ctx = WhisperContext::new_with_params(
            path.to_str().unwrap(),
            WhisperContextParameters::default(),
        )
        .map_err(|e| EngineError::Init(format!("Failed to load model: {}", e)))?;

        let n_threads = std::thread::available_parallelism()
            .map(|p| (p.get() as i32).max(1))
            .unwrap_or(4);

        info!("Whisper model loaded successfully (using {} threads)", n_threads);

        Ok(Self {
            ctx: Arc::new(ctx),
            n_threads,
        })
    }

    fn run_inference(
        ctx: &WhisperContext,
        samples: &[f32],
        chunk_seconds: u32,
        n_threads: i32,
    ) -> Result<String, EngineError> {
        let duration_secs = samples.len() as f32 / WHISPER_SAMPLE_RATE as f32;

        // Greedy sampling for speed (beam search is 2-3x slower)
        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_n_threads(n_threads);

        // Utterances shorter than the chunk hint decode as one segment
        if duration_secs <= chunk_seconds as f32 {
            params.set_single_segment(true);
        }
        params.set_token_timestamps(false);

        // Hallucination guards: skip likely-silence, reject low-confidence
        // and repetitive output, never carry context between utterances.
        params.set_no_speech_thold(0.6);
        params.set_entropy_thold(2.4);
        params.set_logprob_thold(-1.0);
        params.set_temperature(0.0);
        params.set_temperature_inc(0.2);
        params.set_no_context(true);
        params.set_suppress_non_speech_tokens(true);
        params.set_max_len(80);

        params.set_language(Some("auto"));
        params.set_translate(false);

        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_print_special(false);

        let mut state = ctx
            .create_state()
            .map_err(|e| EngineError::Recognition(format!("Failed to create state: {}", e)))?;

        state
            .full(params, samples)
            .map_err(|e| EngineError::Recognition(format!("Inference failed: {}", e)))?;

        let num_segments = state
            .full_n_segments()
            .map_err(|e| EngineError::Recognition(format!("Failed to get segments: {}", e)))?;

        let mut text = String::new();
        for i in 0..num_segments {
            let segment = state
                .full_get_segment_text(i)
                .map_err(|e| EngineError::Recognition(format!("Failed to get text: {}", e)))?;
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(segment);
        }

        Ok(text)
    }
}

#[async_trait::async_trait]
impl SpeechRecognizer for WhisperEngine {
    async fn recognize(&self, samples: Vec<f32>, chunk_seconds: u32) -> Result<String, EngineError> {
        let ctx = Arc::clone(&self.ctx);
        let n_threads = self.n_threads;
        tokio::task::spawn_blocking(move || {
            Self::run_inference(&ctx, &samples, chunk_seconds, n_threads)
        })
        .await
        .map_err(|e| EngineError::Recognition(format!("Inference task panicked: {}", e)))?
    }
}

/// Non-speech placeholders whisper emits for music, silence and the like.
const FILLER_TOKENS: &[&str] = &[
    "[music]",
    "[blank_audio]",
    "[silence]",
    "[applause]",
    "[laughter]",
    "[noise]",
    "[inaudible]",
    "(music)",
    "(laughs)",
    "(laughter)",
    "(applause)",
    "*music*",
];

/// Strip known filler tokens from a recognition result and trim the rest.
/// A result made up entirely of fillers collapses to the empty string.
pub fn strip_fillers(text: &str) -> String {
    text.split_whitespace()
        .filter(|token| {
            let lowered = token.to_lowercase();
            !FILLER_TOKENS.contains(&lowered.as_str())
        })
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}
