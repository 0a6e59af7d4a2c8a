//! Command-line surface for the discussion driver.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// muxcrew - drive a team of interactive AI CLIs inside tmux sessions.
#[derive(Parser)]
#[command(name = "muxcrew")]
#[command(about = "Multi-agent orchestration for interactive AI CLIs")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, default_value = "muxcrew.yaml")]
    pub config: PathBuf,

    /// Log file (overrides the configuration).
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Verbose logging (debug level).
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a facilitated discussion between agents.
    Discuss {
        /// Discussion topic.
        topic: String,

        /// Participating agents, in speaking order.
        #[arg(long, value_delimiter = ',', default_value = "claude,gemini")]
        agents: Vec<String>,

        /// Maximum number of turns.
        #[arg(long, default_value_t = 10)]
        max_turns: usize,

        /// Rolling turn-history size.
        #[arg(long, default_value_t = 200)]
        history_size: usize,

        /// Skip conversational history (smoke-test prompts only).
        #[arg(long)]
        no_history: bool,

        /// Start sessions that are not already running.
        #[arg(long)]
        auto_start: bool,

        /// Kill pre-existing sessions before starting.
        #[arg(long)]
        kill_existing: bool,

        /// Kill sessions after the discussion finishes.
        #[arg(long)]
        cleanup_after: bool,

        /// Agent that takes the first turn (defaults to the first listed).
        #[arg(long)]
        start_with: Option<String>,

        /// Per-agent session name override, as name=session. Repeatable.
        #[arg(long, value_name = "NAME=SESSION")]
        session: Vec<String>,

        /// Per-agent executable override, as name=executable. Repeatable.
        #[arg(long, value_name = "NAME=EXECUTABLE")]
        executable: Vec<String>,

        /// Working directory applied to every agent.
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Startup timeout in seconds, applied to every agent.
        #[arg(long)]
        startup_timeout: Option<f64>,

        /// Post-spawn wait in seconds, applied to every agent.
        #[arg(long)]
        init_wait: Option<f64>,

        /// Per-agent system prompt, as name=text. Repeatable.
        #[arg(long, value_name = "NAME=TEXT")]
        system_prompt: Vec<String>,

        /// Per-agent system prompt file, as name=path. Repeatable.
        #[arg(long, value_name = "NAME=PATH")]
        system_prompt_file: Vec<String>,

        /// System prompt sent to every agent before the discussion.
        #[arg(long)]
        group_system_prompt: Option<String>,

        /// File holding the group system prompt.
        #[arg(long)]
        group_system_prompt_file: Option<PathBuf>,

        /// Log a preview of every dispatched prompt.
        #[arg(long)]
        debug_prompts: bool,

        /// Preview length for --debug-prompts.
        #[arg(long, default_value_t = 200)]
        debug_prompt_chars: usize,

        /// Write a plain-text transcript to this path.
        #[arg(long)]
        transcript: Option<PathBuf>,
    },

    /// Print status for configured agents.
    Status {
        /// Agents to query (all configured sessions when omitted).
        #[arg(long, value_delimiter = ',')]
        agents: Vec<String>,
    },

    /// Attach the terminal to an agent's session (blocks until detach).
    Attach {
        /// Agent name.
        agent: String,

        /// Attach read-only.
        #[arg(long)]
        read_only: bool,
    },

    /// Kill an agent's session.
    Kill {
        /// Agent name.
        agent: String,
    },
}

/// Split a repeatable `name=value` flag.
pub fn parse_kv(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() && !value.is_empty() => {
            Ok((name.to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{}'", raw)),
    }
}
