use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::thread;

use anyhow::{anyhow, Result};
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use log::{info, warn};

use super::{GenerationConfig, ModelBackend, TokenSequence};
use crate::web::models::Message;

pub fn detect_device() -> &'static str {
    if cfg!(feature = "cuda") {
        "cuda"
    } else {
        "cpu"
    }
}

// llama context types are not Send, so every llama call runs on one worker
// thread. The command channel doubles as the serialization point: one
// in-flight generation per process.
enum Command {
    ApplyTemplate {
        messages: Vec<Message>,
        add_generation_prompt: bool,
        reply: Sender<Result<TokenSequence>>,
    },
    Tokenize {
        text: String,
        reply: Sender<Result<TokenSequence>>,
    },
    Decode {
        tokens: Vec<i32>,
        reply: Sender<Result<String>>,
    },
    Generate {
        input: TokenSequence,
        config: GenerationConfig,
        reply: Sender<Result<TokenSequence>>,
    },
}

// Read once at load time so introspection never crosses the channel.
struct ModelFacts {
    base: String,
    n_ctx_train: usize,
    eos_id: i32,
}

pub struct LlamaCppBackend {
    command_tx: Mutex<Sender<Command>>,
    facts: ModelFacts,
    _worker: thread::JoinHandle<()>,
}

impl LlamaCppBackend {
    pub fn load(model_path: &Path, n_gpu_layers: u32) -> Result<Self> {
        let (command_tx, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path = model_path.to_path_buf();
        let worker = thread::Builder::new()
            .name("llama-worker".to_string())
            .spawn(move || worker_main(path, n_gpu_layers, ready_tx, command_rx))?;
        let facts = ready_rx
            .recv()
            .map_err(|_| anyhow!("llama worker exited during startup"))??;
        info!(
            "Model ready: {} (context window {} tokens)",
            facts.base, facts.n_ctx_train
        );
        Ok(Self {
            command_tx: Mutex::new(command_tx),
            facts,
            _worker: worker,
        })
    }

    fn dispatch<T>(&self, make: impl FnOnce(Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = mpsc::channel();
        let command_tx = self
            .command_tx
            .lock()
            .map_err(|_| anyhow!("llama worker channel poisoned"))?
            .clone();
        command_tx
            .send(make(reply_tx))
            .map_err(|_| anyhow!("llama worker is gone"))?;
        reply_rx
            .recv()
            .map_err(|_| anyhow!("llama worker dropped the request"))?
    }
}

impl ModelBackend for LlamaCppBackend {
    fn apply_template(
        &self,
        messages: &[Message],
        add_generation_prompt: bool,
    ) -> Result<TokenSequence> {
        let messages = messages.to_vec();
        self.dispatch(|reply| Command::ApplyTemplate {
            messages,
            add_generation_prompt,
            reply,
        })
    }

    fn tokenize(&self, text: &str) -> Result<TokenSequence> {
        let text = text.to_string();
        self.dispatch(|reply| Command::Tokenize { text, reply })
    }

    fn decode(&self, tokens: &[i32]) -> Result<String> {
        let tokens = tokens.to_vec();
        self.dispatch(|reply| Command::Decode { tokens, reply })
    }

    fn generate(&self, input: TokenSequence, config: &GenerationConfig) -> Result<TokenSequence> {
        let config = config.clone();
        self.dispatch(|reply| Command::Generate {
            input,
            config,
            reply,
        })
    }

    fn max_position_embeddings(&self) -> Option<usize> {
        Some(self.facts.n_ctx_train)
    }

    fn model_max_length(&self) -> Option<usize> {
        // The GGUF tokenizer carries no separate length limit.
        None
    }

    fn eos_token_id(&self) -> Option<i32> {
        Some(self.facts.eos_id)
    }

    fn pad_token_id(&self) -> Option<i32> {
        None
    }

    fn model_identifier(&self) -> String {
        self.facts.base.clone()
    }
}

fn worker_main(
    model_path: PathBuf,
    n_gpu_layers: u32,
    ready_tx: Sender<Result<ModelFacts>>,
    commands: Receiver<Command>,
) {
    let (backend, model, template) = match init_model(&model_path, n_gpu_layers) {
        Ok(parts) => parts,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let facts = ModelFacts {
        base: model
            .meta_val_str("general.name")
            .unwrap_or_else(|_| artifact_stem(&model_path)),
        n_ctx_train: model.n_ctx_train() as usize,
        eos_id: model.token_eos().0,
    };
    if ready_tx.send(Ok(facts)).is_err() {
        return;
    }

    while let Ok(command) = commands.recv() {
        match command {
            Command::ApplyTemplate {
                messages,
                add_generation_prompt,
                reply,
            } => {
                let _ = reply.send(apply_template(
                    &model,
                    &template,
                    &messages,
                    add_generation_prompt,
                ));
            }
            Command::Tokenize { text, reply } => {
                let _ = reply.send(tokenize(&model, &text));
            }
            Command::Decode { tokens, reply } => {
                let _ = reply.send(decode(&model, &tokens));
            }
            Command::Generate {
                input,
                config,
                reply,
            } => {
                let _ = reply.send(run_generation(&backend, &model, &input, &config));
            }
        }
    }
}

fn init_model(
    model_path: &Path,
    n_gpu_layers: u32,
) -> Result<(LlamaBackend, LlamaModel, LlamaChatTemplate)> {
    let backend =
        LlamaBackend::init().map_err(|e| anyhow!("failed to init llama backend: {}", e))?;
    let params = LlamaModelParams::default().with_n_gpu_layers(n_gpu_layers);
    let model = LlamaModel::load_from_file(&backend, model_path, &params)
        .map_err(|e| anyhow!("failed to load model {}: {}", model_path.display(), e))?;
    let template = match model.chat_template(None) {
        Ok(template) => template,
        Err(_) => {
            warn!("Model has no embedded chat template, falling back to chatml");
            LlamaChatTemplate::new("chatml")
                .map_err(|e| anyhow!("failed to create fallback chat template: {}", e))?
        }
    };
    Ok((backend, model, template))
}

fn artifact_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn apply_template(
    model: &LlamaModel,
    template: &LlamaChatTemplate,
    messages: &[Message],
    add_generation_prompt: bool,
) -> Result<TokenSequence> {
    let chat_messages = messages
        .iter()
        .map(|m| LlamaChatMessage::new(m.role.as_str().to_string(), m.content.clone()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("invalid chat message: {}", e))?;
    let prompt = model
        .apply_chat_template(template, &chat_messages, add_generation_prompt)
        .map_err(|e| anyhow!("failed to apply chat template: {}", e))?;
    let tokens = model
        .str_to_token(&prompt, AddBos::Never)
        .map_err(|e| anyhow!("failed to tokenize templated prompt: {}", e))?;
    Ok(to_sequence(&tokens))
}

fn tokenize(model: &LlamaModel, text: &str) -> Result<TokenSequence> {
    let tokens = model
        .str_to_token(text, AddBos::Always)
        .map_err(|e| anyhow!("failed to tokenize prompt: {}", e))?;
    Ok(to_sequence(&tokens))
}

fn decode(model: &LlamaModel, tokens: &[i32]) -> Result<String> {
    let mut decoder = encoding_rs::UTF_8.new_decoder();
    let mut text = String::new();
    for &id in tokens {
        let piece = model
            .token_to_piece(LlamaToken(id), &mut decoder, false, None)
            .map_err(|e| anyhow!("failed to decode token {}: {}", id, e))?;
        text.push_str(&piece);
    }
    Ok(text)
}

fn build_sampler(config: &GenerationConfig) -> LlamaSampler {
    let mut samplers = Vec::new();
    if config.repetition_penalty != 1.0 {
        // llama.cpp has no n-gram blocker; the penalty window stands in.
        let last_n = (config.no_repeat_ngram_size * 16).max(64) as i32;
        samplers.push(LlamaSampler::penalties(
            last_n,
            config.repetition_penalty,
            0.0,
            0.0,
        ));
    }
    if config.do_sample {
        samplers.push(LlamaSampler::top_p(config.top_p, 1));
        samplers.push(LlamaSampler::temp(config.temperature));
        samplers.push(LlamaSampler::dist(0));
    } else {
        samplers.push(LlamaSampler::greedy());
    }
    if samplers.len() == 1 {
        samplers.pop().unwrap_or_else(|| LlamaSampler::greedy())
    } else {
        LlamaSampler::chain_simple(samplers)
    }
}

fn run_generation(
    backend: &LlamaBackend,
    model: &LlamaModel,
    input: &TokenSequence,
    config: &GenerationConfig,
) -> Result<TokenSequence> {
    if input.is_empty() {
        return Err(anyhow!("cannot generate from an empty prompt"));
    }
    let prompt_tokens: Vec<LlamaToken> =
        input.as_slice().iter().map(|&id| LlamaToken(id)).collect();

    let wanted = (prompt_tokens.len() + config.max_new_tokens) as u32;
    let n_ctx = wanted.min(model.n_ctx_train()).max(512);
    let ctx_params = LlamaContextParams::default().with_n_ctx(NonZeroU32::new(n_ctx));
    let mut ctx = model
        .new_context(backend, ctx_params)
        .map_err(|e| anyhow!("failed to create llama context: {}", e))?;

    // Prefill the prompt in batch-sized chunks.
    let n_batch = ctx.n_batch() as usize;
    for chunk in prompt_tokens.chunks(n_batch.max(1)) {
        let mut batch = LlamaBatch::get_one(chunk)
            .map_err(|e| anyhow!("failed to create prompt batch: {}", e))?;
        ctx.decode(&mut batch)
            .map_err(|e| anyhow!("prompt decode failed: {}", e))?;
    }

    let mut sampler = build_sampler(config);
    let mut output = prompt_tokens;
    for _ in 0..config.max_new_tokens {
        let token = sampler.sample(&ctx, -1);
        sampler.accept(token);

        if model.is_eog_token(token) {
            break;
        }
        if let Some(stop_id) = config.eos_token_id {
            if token.0 == stop_id {
                break;
            }
        }

        output.push(token);

        let next = [token];
        let mut batch = LlamaBatch::get_one(&next)
            .map_err(|e| anyhow!("failed to create batch: {}", e))?;
        ctx.decode(&mut batch)
            .map_err(|e| anyhow!("token decode failed: {}", e))?;
    }

    Ok(to_sequence(&output))
}

fn to_sequence(tokens: &[LlamaToken]) -> TokenSequence {
    TokenSequence::new(tokens.iter().map(|t| t.0).collect())
}
