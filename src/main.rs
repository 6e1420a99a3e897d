//! nano-batchgen CLI: batched text generation over a list of prompts.

use std::path::PathBuf;
use std::time::Instant;

use candle_core::{DType, Device};
use clap::{Parser, ValueEnum};

use nano_batchgen::{
    download_model, load_config, load_local, load_safetensors, Error, GenerationConfig, Generator,
    HfTextCodec, ModelFiles, Qwen3ForCausalLM, Result, TextCodec,
};

const DEFAULT_PROMPTS: [&str; 4] = [
    "Once upon a time,",
    "I don't like to",
    "A turbo encabulator is a",
    "In the words of Mark Twain,",
];

#[derive(Parser, Debug)]
#[command(name = "nano-batchgen")]
#[command(version, about = "Batched text generation with a per-slot KV cache")]
struct Args {
    /// Directory containing config.json, tokenizer.json and *.safetensors
    #[arg(long, conflicts_with = "model")]
    model_dir: Option<PathBuf>,

    /// HuggingFace model ID
    #[arg(short, long)]
    model: Option<String>,

    /// Model revision on the Hub
    #[arg(long, default_value = "main")]
    revision: String,

    /// JSON file with a GenerationConfig; flags override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Prompts per session
    #[arg(long)]
    batch_size: Option<usize>,

    /// Maximum tokens to generate per prompt
    #[arg(long)]
    max_new_tokens: Option<usize>,

    /// Cache capacity per prompt (prompt + generated tokens)
    #[arg(long)]
    max_seq_len: Option<usize>,

    /// Sampling temperature (0.0 = greedy)
    #[arg(long)]
    temperature: Option<f32>,

    /// Top-k sampling (0 = disabled)
    #[arg(long)]
    top_k: Option<usize>,

    /// Top-p sampling threshold (0.0 = disabled)
    #[arg(long)]
    top_p: Option<f32>,

    /// Minimum probability kept during top-p
    #[arg(long)]
    min_p: Option<f32>,

    /// Typical sampling mass (0.0 = disabled)
    #[arg(long)]
    typical: Option<f32>,

    /// Repetition penalty
    #[arg(long)]
    repetition_penalty: Option<f32>,

    /// Positions that carry the full repetition penalty
    #[arg(long)]
    penalty_sustain: Option<usize>,

    /// Positions over which the repetition penalty fades out
    #[arg(long)]
    penalty_decay: Option<usize>,

    /// Let the model emit its end-of-sequence token
    #[arg(long)]
    allow_eos: bool,

    /// Stop a prompt once its continuation contains this string (repeatable)
    #[arg(long = "stop")]
    stop: Vec<String>,

    /// RNG seed
    #[arg(long)]
    seed: Option<u64>,

    /// File with one prompt per line
    #[arg(long)]
    prompts_file: Option<PathBuf>,

    /// Template file; `$prompt` is replaced by each prompt
    #[arg(long)]
    template: Option<PathBuf>,

    /// Weight data type
    #[arg(long, value_enum, default_value = "f32")]
    dtype: DTypeArg,

    /// Run on CPU even if a GPU is available
    #[arg(long)]
    cpu: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum DTypeArg {
    F32,
    F16,
    Bf16,
}

impl From<DTypeArg> for DType {
    fn from(arg: DTypeArg) -> Self {
        match arg {
            DTypeArg::F32 => DType::F32,
            DTypeArg::F16 => DType::F16,
            DTypeArg::Bf16 => DType::BF16,
        }
    }
}

/// Settings used by the batch drivers when no config file is given.
fn driver_defaults() -> GenerationConfig {
    let mut config = GenerationConfig::default().batch_size(4).max_new_tokens(300);
    config.sampling.token_repetition_penalty_max = 1.2;
    config.sampling.temperature = 0.95;
    config.sampling.top_p = 0.65;
    config.sampling.top_k = 100;
    config.sampling.typical = 0.5;
    config
}

fn build_config(args: &Args) -> Result<GenerationConfig> {
    let mut config = match &args.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => driver_defaults(),
    };

    if let Some(v) = args.batch_size {
        config.batch_size = v;
    }
    if let Some(v) = args.max_new_tokens {
        config.max_new_tokens = v;
    }
    if let Some(v) = args.max_seq_len {
        config.max_seq_len = v;
    }
    let sampling = &mut config.sampling;
    if let Some(v) = args.temperature {
        sampling.temperature = v;
    }
    if let Some(v) = args.top_k {
        sampling.top_k = v;
    }
    if let Some(v) = args.top_p {
        sampling.top_p = v;
    }
    if let Some(v) = args.min_p {
        sampling.min_p = v;
    }
    if let Some(v) = args.typical {
        sampling.typical = v;
    }
    if let Some(v) = args.repetition_penalty {
        sampling.token_repetition_penalty_max = v;
    }
    if let Some(v) = args.penalty_sustain {
        sampling.token_repetition_penalty_sustain = v;
    }
    if let Some(v) = args.penalty_decay {
        sampling.token_repetition_penalty_decay = v;
    }
    config.stop_strings.extend(args.stop.iter().cloned());
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    Ok(config)
}

fn load_prompts(args: &Args) -> Result<Vec<String>> {
    let inputs: Vec<String> = match &args.prompts_file {
        Some(path) => std::fs::read_to_string(path)?
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect(),
        None => DEFAULT_PROMPTS.iter().map(|p| p.to_string()).collect(),
    };
    if inputs.is_empty() {
        return Err(Error::Config("no prompts given".into()));
    }

    match &args.template {
        Some(path) => {
            let template = std::fs::read_to_string(path)?;
            if !template.contains("$prompt") {
                return Err(Error::Config(format!(
                    "template {} has no $prompt placeholder",
                    path.display()
                )));
            }
            Ok(inputs
                .iter()
                .map(|input| template.replace("$prompt", input))
                .collect())
        }
        None => Ok(inputs),
    }
}

fn model_files(args: &Args) -> Result<ModelFiles> {
    match (&args.model_dir, &args.model) {
        (Some(dir), _) => load_local(dir),
        (None, Some(id)) => download_model(id, &args.revision),
        (None, None) => Err(Error::Config(
            "either --model-dir or --model is required".into(),
        )),
    }
}

/// Prompt/output pairs of one finished chunk.
fn format_chunk(prompts: &[String], outputs: &[String]) -> String {
    prompts
        .iter()
        .zip(outputs)
        .map(|(prompt, output)| format!("----------------\nPrompt: {prompt}\nOutput: {output}\n"))
        .collect()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = build_config(&args)?;
    let prompts = load_prompts(&args)?;

    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };
    let started = Instant::now();

    let files = model_files(&args)?;
    let model_config = load_config(&files.config)?;
    let vb = load_safetensors(&files.weights, args.dtype.into(), &device)?;
    let model = Qwen3ForCausalLM::new(&model_config, vb)?;
    let codec = HfTextCodec::from_file(&files.tokenizer)?;

    if !args.allow_eos {
        config.sampling.disallowed_tokens.insert(codec.eos_token_id());
    }
    config.max_seq_len = config.max_seq_len.min(model_config.max_position_embeddings);

    let batch_size = config.batch_size;
    println!(
        "Generating {} prompt(s) with batch size {batch_size}",
        prompts.len()
    );

    let mut generator = Generator::new(model, codec, config)?;
    for chunk in prompts.chunks(batch_size) {
        let outputs = generator.generate(chunk)?;
        print!("{}", format_chunk(chunk, &outputs));
    }
    println!("----------------");
    println!("Time taken: {:.2} seconds", started.elapsed().as_secs_f64());
    Ok(())
}
