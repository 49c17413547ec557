//! `qwen2` — command-line instruct/chat runner for the inference engine.
//!
//! Thin shell around [`qwen2_core::Engine`]: parses flags, builds a
//! [`qwen2_core::sampler::Sampler`] from the temperature/top-p knobs,
//! frames the prompt as ChatML, and either runs one instruct turn or
//! loops reading lines from stdin as a chat session.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use qwen2_core::chatml::{self, Message};
use qwen2_core::sampler::{Sampler, SamplingStrategy};
use qwen2_core::Engine;

/// Command-line chat/instruct runner for the Qwen2 inference engine.
#[derive(Parser, Debug)]
#[command(name = "qwen2", version, about)]
struct Args {
    /// Path to the GGUF model file.
    #[arg(long)]
    model: PathBuf,

    /// Run as a multi-turn chat session, reading lines from stdin.
    #[arg(short = 'i', long = "interactive", alias = "chat", action = clap::ArgAction::SetTrue)]
    interactive: bool,

    /// Run a single instruct turn and exit (the default when `--prompt` is given).
    #[arg(long, action = clap::ArgAction::SetTrue)]
    instruct: bool,

    /// The user message for a single instruct turn.
    #[arg(short = 'p', long = "prompt")]
    prompt: Option<String>,

    /// System prompt prepended to the conversation.
    #[arg(short = 's', long = "system-prompt", visible_alias = "sp")]
    system_prompt: Option<String>,

    /// Sampling temperature. 0 selects greedy argmax.
    #[arg(long, default_value_t = 0.1)]
    temperature: f32,

    /// Nucleus sampling mass. 1.0 disables the nucleus cutoff.
    #[arg(long = "top-p", default_value_t = 0.95)]
    top_p: f32,

    /// Seed the sampler's RNG for reproducible categorical/top-p draws.
    #[arg(long)]
    seed: Option<u64>,

    /// Maximum token position across the whole session (prompt plus every
    /// reply so far). Negative means "up to the model's context length".
    #[arg(short = 'n', long = "max-tokens", default_value_t = 512)]
    max_tokens: i64,

    /// Stream tokens to stdout as they're produced.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    stream: bool,

    /// Echo the rendered prompt before the reply.
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    echo: bool,
}

impl Args {
    fn validate(&self) -> qwen2_core::Result<()> {
        if self.interactive && self.instruct {
            return Err(qwen2_core::Error::config(
                "--interactive and --instruct are mutually exclusive",
            ));
        }
        if self.temperature < 0.0 {
            return Err(qwen2_core::Error::config(format!(
                "--temperature must be >= 0, got {}",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(qwen2_core::Error::config(format!("--top-p must be in [0, 1], got {}", self.top_p)));
        }
        Ok(())
    }

    fn sampler(&self) -> Sampler {
        let strategy = if self.temperature == 0.0 {
            SamplingStrategy::Greedy
        } else if self.top_p >= 1.0 {
            SamplingStrategy::Categorical { temperature: self.temperature }
        } else {
            SamplingStrategy::TopP { temperature: self.temperature, top_p: self.top_p }
        };
        let sampler = Sampler::new(strategy);
        match self.seed {
            Some(seed) => sampler.with_seed(seed),
            None => sampler,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if let Err(e) = args.validate() {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> qwen2_core::Result<()> {
    tracing::info!(model = %args.model.display(), "loading model");
    let mut engine = Engine::load(&args.model)?;
    let max_tokens = if args.max_tokens < 0 {
        engine.config().seq_len
    } else {
        (args.max_tokens as usize).min(engine.config().seq_len)
    };
    let sampler = args.sampler();

    if args.interactive {
        run_chat(&mut engine, args, max_tokens, &sampler)
    } else {
        run_instruct(&mut engine, args, max_tokens, &sampler)
    }
}

fn run_instruct(engine: &mut Engine, args: &Args, max_tokens: usize, sampler: &Sampler) -> qwen2_core::Result<()> {
    let user_prompt = args.prompt.clone().unwrap_or_default();
    let mut messages = Vec::new();
    if let Some(system) = &args.system_prompt {
        messages.push(Message { role: "system", content: system });
    }
    messages.push(Message { role: "user", content: &user_prompt });

    let rendered = chatml::render_with_assistant_header(&messages);
    if args.echo {
        print!("{rendered}");
    }

    let prompt_ids = engine.tokenizer().encode(&rendered);
    generate_and_print(engine, &prompt_ids, max_tokens, sampler, args.stream)?;
    println!();
    Ok(())
}

fn run_chat(engine: &mut Engine, args: &Args, max_tokens: usize, sampler: &Sampler) -> qwen2_core::Result<()> {
    let stdin = io::stdin();
    let mut first_turn = true;
    loop {
        print!("{}", if first_turn { "" } else { "\n" });
        print!("> ");
        io::stdout().flush().ok();

        let mut line = String::new();
        if stdin.read_line(&mut line).unwrap_or(0) == 0 {
            break; // EOF
        }
        let line = line.trim_end_matches('\n');
        if line.is_empty() {
            continue;
        }

        // The system prompt only needs to enter the KV cache once: on
        // every later turn the model already carries it from position 0.
        let mut turn = String::new();
        if first_turn {
            if let Some(system) = &args.system_prompt {
                turn.push_str(&chatml::render(&[Message { role: "system", content: system }]));
            }
        }
        turn.push_str(&chatml::render_with_assistant_header(&[Message { role: "user", content: line }]));

        let prompt_ids = engine.tokenizer().encode(&turn);
        generate_and_print(engine, &prompt_ids, max_tokens, sampler, args.stream)?;
        println!();

        first_turn = false;
    }
    Ok(())
}

/// Run generation, streaming printable tokens as they arrive if
/// `stream` is set, and return every generated id (stop token included).
fn generate_and_print(
    engine: &mut Engine,
    prompt_ids: &[u32],
    max_tokens: usize,
    sampler: &Sampler,
    stream: bool,
) -> qwen2_core::Result<Vec<u32>> {
    let budget = max_tokens.saturating_sub(engine.position());
    engine.generate(prompt_ids, budget, sampler, |_id, text| {
        if stream {
            if let Some(text) = text {
                print!("{}", escape_control_chars(text));
                io::stdout().flush().ok();
            }
        }
    })
}

/// Escape non-newline control codepoints as `\uXXXX` so a raw terminal
/// never receives a literal control byte.
fn escape_control_chars(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_control() && c != '\n' {
                format!("\\u{:04x}", c as u32)
            } else {
                c.to_string()
            }
        })
        .collect()
}
