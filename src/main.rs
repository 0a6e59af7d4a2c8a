use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

use muxcrew::cli::{parse_kv, Cli, Commands};
use muxcrew::config::OrchestraConfig;
use muxcrew::controller::{session_spec, AgentController};
use muxcrew::orchestrator::{DiscussionOptions, Orchestrator};
use muxcrew::{logging, transcript};
use mux_session::TmuxBackend;

/// Driver failure, split by exit code: user errors exit 2, transport and
/// setup failures exit 1.
enum RunError {
    User(String),
    Setup(String),
}

impl From<muxcrew::CoreError> for RunError {
    fn from(err: muxcrew::CoreError) -> Self {
        RunError::Setup(err.to_string())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::User(message)) => {
            eprintln!("[error] {}", message);
            ExitCode::from(2)
        }
        Err(RunError::Setup(message)) => {
            eprintln!("[error] {}", message);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<(), RunError> {
    let config = load_config(&cli.config)?;

    let mut logging_config = config.logging.clone();
    if cli.verbose {
        logging_config.level = "debug".to_string();
    }
    if let Some(path) = &cli.log_file {
        logging_config.file = Some(path.clone());
    }
    logging::init(&logging_config)?;

    match cli.command {
        Commands::Discuss {
            topic,
            agents,
            max_turns,
            history_size,
            no_history,
            auto_start,
            kill_existing,
            cleanup_after,
            start_with,
            session,
            executable,
            cwd,
            startup_timeout,
            init_wait,
            system_prompt,
            system_prompt_file,
            group_system_prompt,
            group_system_prompt_file,
            debug_prompts,
            debug_prompt_chars,
            transcript: transcript_path,
        } => {
            if agents.is_empty() {
                return Err(RunError::User("no agents specified".to_string()));
            }

            let sessions = parse_kv_flags(&session)?;
            let executables = parse_kv_flags(&executable)?;
            let mut prompts = parse_kv_flags(&system_prompt)?;
            for (name, path) in parse_kv_flags(&system_prompt_file)? {
                let text = std::fs::read_to_string(&path).map_err(|err| {
                    RunError::User(format!("cannot read system prompt file '{}': {}", path, err))
                })?;
                prompts.insert(name, text);
            }
            let group_prompt = match (group_system_prompt, group_system_prompt_file) {
                (Some(text), _) => Some(text),
                (None, Some(path)) => Some(std::fs::read_to_string(&path).map_err(|err| {
                    RunError::User(format!(
                        "cannot read group system prompt file '{}': {}",
                        path.display(),
                        err
                    ))
                })?),
                (None, None) => None,
            };

            let participants = order_participants(agents, start_with.as_deref())?;

            let orchestrator = Arc::new(Orchestrator::new());
            orchestrator.set_prompt_debug(debug_prompts, debug_prompt_chars);

            for name in &participants {
                let mut tunables = config.resolve(name);
                if let Some(exe) = executables.get(name) {
                    tunables.executable = exe.clone();
                }
                if let Some(dir) = &cwd {
                    tunables.working_dir = Some(dir.clone());
                }
                if let Some(secs) = startup_timeout {
                    tunables.startup_timeout = std::time::Duration::from_secs_f64(secs.max(0.0));
                }
                if let Some(secs) = init_wait {
                    tunables.init_wait = std::time::Duration::from_secs_f64(secs.max(0.0));
                }

                let session_name = sessions
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| config.session_name(name));
                let spec = session_spec(&session_name, &tunables);
                let backend = TmuxBackend::new(spec).await.map_err(|err| {
                    RunError::Setup(format!("backend for '{}': {}", name, err))
                })?;
                let mut controller = AgentController::new(name, Box::new(backend), tunables);

                if kill_existing && controller.kill_session().await? {
                    info!(agent = %name, "killed pre-existing session");
                }
                if !controller.session_exists().await {
                    if auto_start {
                        controller.start_session(true).await?;
                    } else {
                        return Err(RunError::Setup(format!(
                            "session '{}' for agent '{}' is not running (use --auto-start)",
                            controller.session_name(),
                            name
                        )));
                    }
                }

                orchestrator.register_controller(name.clone(), controller);
            }

            bootstrap_prompts(&orchestrator, &participants, &prompts, group_prompt.as_deref())
                .await;

            let options = DiscussionOptions {
                participants: participants.clone(),
                max_turns,
                include_history: !no_history,
                max_history: history_size,
                capture_tail_limit: config.tmux.capture_lines,
            };
            let outcome = orchestrator
                .start_discussion(&topic, options, None, None)
                .await?;

            for turn in &outcome.conversation {
                let body = match &turn.response {
                    Some(response) if !response.is_empty() => response.clone(),
                    _ if turn.metadata.queued => "(queued)".to_string(),
                    _ => "(no response captured)".to_string(),
                };
                println!("[{}] {}: {}", turn.turn, turn.speaker, body);
            }

            if let Some(path) = transcript_path {
                if let Err(err) = transcript::write(
                    &path,
                    &outcome.conversation,
                    outcome.manager.context_manager(),
                ) {
                    warn!("transcript not written: {}", err);
                }
            }

            if cleanup_after {
                for name in &participants {
                    if let Some(controller) = orchestrator.controller(name) {
                        let mut guard = controller.lock().await;
                        if let Err(err) = guard.kill_session().await {
                            warn!(agent = %name, "cleanup failed: {}", err);
                        }
                    }
                }
            }

            Ok(())
        }

        Commands::Status { agents } => {
            let names = if agents.is_empty() {
                let mut configured: Vec<String> = config.agents.keys().cloned().collect();
                configured.sort();
                configured
            } else {
                agents
            };
            if names.is_empty() {
                return Err(RunError::User(
                    "no agents configured; pass --agents".to_string(),
                ));
            }

            for name in names {
                let controller = build_controller(&config, &name).await?;
                let status = controller.status().await;
                let rendered = serde_json::to_string_pretty(&status)
                    .unwrap_or_else(|_| format!("{:?}", status.state));
                println!("{}:\n{}", name, rendered);
            }
            Ok(())
        }

        Commands::Attach { agent, read_only } => {
            let controller = build_controller(&config, &agent).await?;
            controller.attach(read_only).await?;
            Ok(())
        }

        Commands::Kill { agent } => {
            let mut controller = build_controller(&config, &agent).await?;
            if controller.kill_session().await? {
                println!("killed session '{}'", controller.session_name());
            } else {
                println!("session '{}' not running", controller.session_name());
            }
            Ok(())
        }
    }
}

fn load_config(path: &PathBuf) -> Result<OrchestraConfig, RunError> {
    if !path.exists() {
        // The default path is optional; anything explicit must exist.
        if path == &PathBuf::from("muxcrew.yaml") {
            return Ok(OrchestraConfig::default());
        }
        return Err(RunError::User(format!(
            "configuration file '{}' not found",
            path.display()
        )));
    }
    OrchestraConfig::load(path).map_err(|err| RunError::User(err.to_string()))
}

fn parse_kv_flags(raw: &[String]) -> Result<HashMap<String, String>, RunError> {
    let mut parsed = HashMap::new();
    for item in raw {
        let (name, value) = parse_kv(item).map_err(RunError::User)?;
        parsed.insert(name, value);
    }
    Ok(parsed)
}

fn order_participants(
    agents: Vec<String>,
    start_with: Option<&str>,
) -> Result<Vec<String>, RunError> {
    match start_with {
        None => Ok(agents),
        Some(first) => {
            let index = agents.iter().position(|name| name == first).ok_or_else(|| {
                RunError::User(format!("--start-with '{}' is not in --agents", first))
            })?;
            let mut ordered = agents;
            ordered.rotate_left(index);
            Ok(ordered)
        }
    }
}

async fn build_controller(
    config: &OrchestraConfig,
    name: &str,
) -> Result<AgentController, RunError> {
    let tunables = config.resolve(name);
    let spec = session_spec(&config.session_name(name), &tunables);
    let backend = TmuxBackend::new(spec)
        .await
        .map_err(|err| RunError::Setup(format!("backend for '{}': {}", name, err)))?;
    Ok(AgentController::new(name, Box::new(backend), tunables))
}

/// Send system prompts before the first turn: the group prompt to every
/// agent, then per-agent prompts. Each send waits for the assistant to
/// settle so the instructions land before the discussion starts.
async fn bootstrap_prompts(
    orchestrator: &Arc<Orchestrator>,
    participants: &[String],
    prompts: &HashMap<String, String>,
    group_prompt: Option<&str>,
) {
    for name in participants {
        let mut to_send: Vec<&str> = Vec::new();
        if let Some(group) = group_prompt {
            to_send.push(group);
        }
        if let Some(own) = prompts.get(name) {
            to_send.push(own);
        }

        for prompt in to_send {
            match orchestrator.dispatch_command(name, prompt, true).await {
                Ok(summary) if summary.dispatched => {
                    if let Some(controller) = orchestrator.controller(name) {
                        let mut guard = controller.lock().await;
                        let _ = guard.wait_for_ready().await;
                    }
                }
                Ok(summary) => {
                    warn!(
                        agent = %name,
                        queued = summary.queued,
                        "system prompt not dispatched"
                    );
                }
                Err(err) => warn!(agent = %name, "system prompt failed: {}", err),
            }
        }
    }
}
