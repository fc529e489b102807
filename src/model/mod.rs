pub mod llama;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use log::{info, warn};

use crate::limits;
use crate::prompt;
use crate::sanitize;
use crate::web::models::{ChatRequest, Message};

/// Token sequence owned by one request for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSequence {
    ids: Vec<i32>,
}

impl TokenSequence {
    pub fn new(ids: Vec<i32>) -> Self {
        Self { ids }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.ids
    }

    pub fn into_vec(self) -> Vec<i32> {
        self.ids
    }

    /// Keep only the last `n` tokens, dropping the front.
    pub fn keep_last(mut self, n: usize) -> Self {
        if self.ids.len() > n {
            self.ids.drain(..self.ids.len() - n);
        }
        self
    }
}

/// Decoding parameters handed to the generation service. Requests never
/// influence anything here except `max_new_tokens`; decoding stays greedy
/// so identical input yields identical output.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    pub do_sample: bool,
    pub temperature: f32,
    pub top_p: f32,
    pub no_repeat_ngram_size: usize,
    pub repetition_penalty: f32,
    pub eos_token_id: Option<i32>,
    pub pad_token_id: Option<i32>,
}

impl GenerationConfig {
    /// The fixed deterministic profile used for every chat request.
    /// `stop_id` serves as both the stop and pad token.
    pub fn deterministic(max_new_tokens: usize, stop_id: Option<i32>) -> Self {
        Self {
            max_new_tokens,
            do_sample: false,
            temperature: 0.0,
            top_p: 1.0,
            no_repeat_ngram_size: 4,
            repetition_penalty: 1.1,
            eos_token_id: stop_id,
            pad_token_id: stop_id,
        }
    }
}

/// The two narrow contracts the pipeline consumes: tokenization/templating
/// and bounded generation. One long-lived object implements both; handlers
/// only ever see this trait.
pub trait ModelBackend: Send + Sync {
    /// Serialize role-tagged messages into a generation-ready token
    /// sequence using the model's own chat format.
    fn apply_template(
        &self,
        messages: &[Message],
        add_generation_prompt: bool,
    ) -> Result<TokenSequence>;

    /// Tokenize raw text, for the fallback prompt path.
    fn tokenize(&self, text: &str) -> Result<TokenSequence>;

    /// Decode token ids back to text, skipping control tokens.
    fn decode(&self, tokens: &[i32]) -> Result<String>;

    /// Run one bounded generation. Returns the full sequence, input prefix
    /// included.
    fn generate(&self, input: TokenSequence, config: &GenerationConfig) -> Result<TokenSequence>;

    fn max_position_embeddings(&self) -> Option<usize>;
    fn model_max_length(&self) -> Option<usize>;
    fn eos_token_id(&self) -> Option<i32>;
    fn pad_token_id(&self) -> Option<i32>;

    /// Identifier of the underlying base model, for introspection.
    fn model_identifier(&self) -> String;
}

/// Long-lived handle on the loaded model, shared across requests.
pub struct ModelManager {
    backend: Arc<dyn ModelBackend>,
    model_limit: usize,
    base: String,
    adapter_dir: String,
    device: &'static str,
}

impl ModelManager {
    /// Load the model artifact from the adapter directory. Failure here is
    /// fatal for startup.
    pub fn from_adapter_dir(adapter_dir: &str) -> Result<Self> {
        let artifact = find_model_artifact(Path::new(adapter_dir))?;
        let device = llama::detect_device();
        let n_gpu_layers = if device == "cuda" { 1000 } else { 0 };
        info!("Loading model artifact {} on {}", artifact.display(), device);
        let backend = llama::LlamaCppBackend::load(&artifact, n_gpu_layers)?;
        Ok(Self::with_backend(
            Arc::new(backend),
            adapter_dir.to_string(),
            device,
        ))
    }

    pub fn with_backend(
        backend: Arc<dyn ModelBackend>,
        adapter_dir: String,
        device: &'static str,
    ) -> Self {
        let model_limit = limits::resolve_model_limit(backend.as_ref());
        let base = backend.model_identifier();
        info!("Context window resolved to {} tokens", model_limit);
        Self {
            backend,
            model_limit,
            base,
            adapter_dir,
            device,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn adapter_dir(&self) -> &str {
        &self.adapter_dir
    }

    pub fn device(&self) -> &'static str {
        self.device
    }

    /// The whole chat pipeline for one request: clamp, build, budget,
    /// generate, decode the new span, normalize.
    pub fn answer(&self, req: &ChatRequest) -> Result<String> {
        let max_new = limits::clamp_max_new(req.max_new_tokens);
        let context = req.context.as_deref().unwrap_or(&[]);

        let tokens = prompt::build_input_tokens(
            self.backend.as_ref(),
            req.system.as_deref(),
            context,
            &req.user,
        )?;
        let tokens = limits::apply_context_budget(tokens, max_new, self.model_limit);
        let input_len = tokens.len();

        let stop_id = self
            .backend
            .eos_token_id()
            .or_else(|| self.backend.pad_token_id());
        let config = GenerationConfig::deterministic(max_new, stop_id);

        let output = self.backend.generate(tokens, &config)?;
        let new_span = output.as_slice().get(input_len..).unwrap_or(&[]);
        let text = self.backend.decode(new_span)?;
        Ok(sanitize::clean(&text))
    }

    /// One-time warmup generation to pre-trigger lazy initialization in the
    /// generation service. Failure only logs; serving proceeds either way.
    pub fn warmup(&self) {
        let stop_id = self
            .backend
            .eos_token_id()
            .or_else(|| self.backend.pad_token_id());
        let config = GenerationConfig::deterministic(8, stop_id);
        match self
            .backend
            .tokenize("hello")
            .and_then(|tokens| self.backend.generate(tokens, &config))
        {
            Ok(_) => info!("Warmup generation complete"),
            Err(e) => warn!("Warmup generation failed (ignored): {:#}", e),
        }
    }
}

// The adapter directory holds the merged GGUF artifact; a direct file path
// is accepted too.
fn find_model_artifact(dir: &Path) -> Result<PathBuf> {
    if dir.is_file() {
        return Ok(dir.to_path_buf());
    }
    let mut candidates: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("adapter directory {} is not readable", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .map(|ext| ext.eq_ignore_ascii_case("gguf"))
                .unwrap_or(false)
        })
        .collect();
    candidates.sort();
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no .gguf artifact found in {}", dir.display()))
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;

    use anyhow::{bail, Result};

    use super::{GenerationConfig, ModelBackend, TokenSequence};
    use crate::web::models::Message;

    /// Scripted stand-in for the real backend: tokens are raw UTF-8 bytes,
    /// generation appends a fixed reply to the input.
    pub struct ScriptedBackend {
        pub reply: Vec<i32>,
        pub fail_template: bool,
        pub fail_generate: bool,
        pub last_config: Mutex<Option<GenerationConfig>>,
    }

    impl ScriptedBackend {
        pub fn new(reply: &str) -> Self {
            Self {
                reply: reply.bytes().map(i32::from).collect(),
                fail_template: false,
                fail_generate: false,
                last_config: Mutex::new(None),
            }
        }
    }

    impl ModelBackend for ScriptedBackend {
        fn apply_template(
            &self,
            messages: &[Message],
            _add_generation_prompt: bool,
        ) -> Result<TokenSequence> {
            if self.fail_template {
                bail!("chat template not supported");
            }
            let joined: String = messages
                .iter()
                .map(|m| format!("<{}>{}", m.role.as_str(), m.content))
                .collect();
            self.tokenize(&joined)
        }

        fn tokenize(&self, text: &str) -> Result<TokenSequence> {
            Ok(TokenSequence::new(text.bytes().map(i32::from).collect()))
        }

        fn decode(&self, tokens: &[i32]) -> Result<String> {
            let bytes: Vec<u8> = tokens
                .iter()
                .filter_map(|&t| u8::try_from(t).ok())
                .collect();
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }

        fn generate(
            &self,
            input: TokenSequence,
            config: &GenerationConfig,
        ) -> Result<TokenSequence> {
            if self.fail_generate {
                bail!("device exploded");
            }
            *self.last_config.lock().unwrap() = Some(config.clone());
            let mut ids = input.into_vec();
            ids.extend_from_slice(&self.reply);
            Ok(TokenSequence::new(ids))
        }

        fn max_position_embeddings(&self) -> Option<usize> {
            Some(4096)
        }

        fn model_max_length(&self) -> Option<usize> {
            None
        }

        fn eos_token_id(&self) -> Option<i32> {
            Some(2)
        }

        fn pad_token_id(&self) -> Option<i32> {
            None
        }

        fn model_identifier(&self) -> String {
            "scripted".to_string()
        }
    }
}
