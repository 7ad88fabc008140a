//! Turnkeeper CLI
//!
//! Replays a JSONL transcript through a conversation context to show how
//! the token budget trims it.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use turnkeeper::context::estimate_tokens;
use turnkeeper::{ContextConfig, ContextEntry, ConversationContext, ExtractiveSummarizer, Role};

/// Turnkeeper - conversation context with a token budget
#[derive(Parser, Debug)]
#[command(name = "turnkeeper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output: debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Feed a transcript of `{"role", "content"}` lines through a context
    Replay {
        /// JSONL transcript file
        transcript: PathBuf,

        /// Session id
        #[arg(long)]
        session: Option<String>,

        /// Token budget
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Share of the live turns trimmed per overflow
        #[arg(long)]
        ratio: Option<f64>,

        /// Summarize trimmed turns instead of dropping them
        #[arg(long)]
        summarize: bool,

        /// How long to wait for pending summaries at the end (ms)
        #[arg(long, default_value_t = 2_000)]
        wait_ms: u64,
    },

    /// Print the effective configuration as TOML
    ShowConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = resolve_config(cli.config.as_deref()).await?;

    match cli.command {
        Command::Replay {
            transcript,
            session,
            max_tokens,
            ratio,
            summarize,
            wait_ms,
        } => {
            let mut config = config;
            if let Some(session) = session {
                config.session_id = session;
            }
            if let Some(max) = max_tokens {
                config = config.with_max_context_tokens(max);
            }
            if let Some(ratio) = ratio {
                config = config.with_compression_ratio(ratio);
            }
            run_replay(config, &transcript, summarize, Duration::from_millis(wait_ms)).await
        }
        Command::ShowConfig => {
            print!("{}", toml::to_string(&config)?);
            Ok(())
        }
    }
}

/// Explicit path, else the default location if present, else defaults
async fn resolve_config(explicit: Option<&Path>) -> anyhow::Result<ContextConfig> {
    if let Some(path) = explicit {
        return ContextConfig::load(path)
            .await
            .with_context(|| format!("Failed to load config from {}", path.display()));
    }

    if let Some(path) = default_config_path() {
        if path.exists() {
            debug!("Using config file {:?}", path);
            return Ok(ContextConfig::load(&path).await?);
        }
    }

    Ok(ContextConfig::default())
}

/// `<config dir>/turnkeeper/config.toml`
fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("turnkeeper").join("config.toml"))
}

fn parse_transcript(content: &str) -> anyhow::Result<Vec<ContextEntry>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str::<ContextEntry>(line)
                .with_context(|| format!("Invalid transcript entry on line {}", i + 1))
        })
        .collect()
}

async fn run_replay(
    config: ContextConfig,
    transcript: &Path,
    summarize: bool,
    wait: Duration,
) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(transcript)
        .await
        .with_context(|| format!("Failed to read transcript {}", transcript.display()))?;
    let entries = parse_transcript(&content)?;

    info!(
        "Replaying {} turns (budget {} tokens)",
        entries.len(),
        config.budget.max_context_tokens
    );

    let ctx = ConversationContext::new(config)?;
    if summarize {
        ctx.set_summarizer(Arc::new(ExtractiveSummarizer))?;
    }

    for entry in entries {
        match entry.role {
            Role::System => ctx.add_system_prompt(entry.content),
            role => ctx.add_message(role, entry.content),
        };

        let tokens = estimate_tokens(&ctx.get_context());
        let trimmed = ctx.process_token_excess(tokens).await?;
        if !trimmed.is_empty() {
            info!("{} tokens over budget, trimmed {} turns", tokens, trimmed.len());
        }
    }

    if summarize && !ctx.wait_for_compression(wait).await {
        info!("Some summaries were still running when the wait ended");
    }

    let final_context = ctx.get_context();
    let report = serde_json::json!({
        "session": ctx.session_id(),
        "estimated_tokens": estimate_tokens(&final_context),
        "stats": ctx.stats(),
        "context": final_context,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    ctx.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_transcript() {
        let entries = parse_transcript(
            "{\"role\":\"system\",\"content\":\"be brief\"}\n\n{\"role\":\"user\",\"content\":\"hi\"}\n",
        )
        .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].role, Role::System);
        assert_eq!(entries[1], ContextEntry::new(Role::User, "hi"));
    }

    #[test]
    fn test_parse_transcript_reports_line() {
        let err = parse_transcript("{\"role\":\"user\",\"content\":\"ok\"}\nnot json").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_default_config_path() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with("turnkeeper/config.toml"));
        }
    }

    #[tokio::test]
    async fn test_replay_runs_to_completion() {
        let dir = tempfile::TempDir::new().unwrap();
        let transcript = dir.path().join("chat.jsonl");
        let lines: Vec<String> = (0..6)
            .map(|i| format!("{{\"role\":\"user\",\"content\":\"{}\"}}", "word ".repeat(20 + i)))
            .collect();
        std::fs::write(&transcript, lines.join("\n")).unwrap();

        let config = ContextConfig::new("replay")
            .with_max_context_tokens(60)
            .with_poll_interval(Duration::from_millis(5));
        run_replay(config, &transcript, true, Duration::from_secs(2))
            .await
            .unwrap();
    }
}
