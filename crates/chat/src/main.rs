use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use medigraph::settings::SettingsError;
use medigraph::{ChatController, Role, SettingsStore, TurnOutcome, TurnProgress};
use medigraph_triage::{TriageError, create_backend};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Terminal client for the MediGraph triage service.
#[derive(Debug, Parser)]
#[command(name = "medigraph", version, about)]
struct Args {
    /// Settings file to load instead of the per-user default.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Triage endpoint URL for this run.
    #[arg(long)]
    endpoint: Option<String>,

    #[arg(long)]
    user_id: Option<String>,

    /// Write the effective settings back to the settings file.
    #[arg(long)]
    save_config: bool,
}

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("failed to create triage client on `{stage}`: {source}"))]
    Backend {
        stage: &'static str,
        source: TriageError,
    },
    #[snafu(display("failed to save settings on `{stage}`: {source}"))]
    SaveSettings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("failed to read from stdin on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to write to stdout on `{stage}`: {source}"))]
    WriteOutput {
        stage: &'static str,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Submit(String),
    Stop,
    Regenerate,
    NewSession,
    History,
    Quit,
    Unknown(String),
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let command = match line {
            "/stop" => Self::Stop,
            "/regen" => Self::Regenerate,
            "/new" => Self::NewSession,
            "/history" => Self::History,
            "/quit" | "/exit" => Self::Quit,
            other if other.starts_with('/') => Self::Unknown(other.to_string()),
            text => Self::Submit(text.to_string()),
        };
        Some(command)
    }
}

enum Input {
    Line(std::io::Result<Option<String>>),
    Progress(TurnProgress),
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let store = match &args.config {
        Some(path) => SettingsStore::new(path.clone()),
        None => SettingsStore::load(),
    };

    let mut settings = (*store.settings()).clone();
    if let Some(endpoint) = args.endpoint {
        settings.endpoint = endpoint;
    }
    if let Some(user_id) = args.user_id {
        settings.user_id = user_id;
    }
    let settings = settings.normalized();

    if args.save_config {
        store.update(settings.clone()).context(SaveSettingsSnafu {
            stage: "save-effective-settings",
        })?;
        eprintln!("saved settings to {}", store.config_path().display());
    }

    let backend = create_backend(settings.to_triage_config()).context(BackendSnafu {
        stage: "create-http-backend",
    })?;
    let mut controller = ChatController::new(backend, settings.to_request_profile());

    eprintln!(
        "connected to {} (session {}). /stop /regen /new /history /quit",
        settings.endpoint,
        controller.session_id()
    );

    run_repl(&mut controller).await
}

async fn run_repl(controller: &mut ChatController) -> Result<(), CliError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = if controller.is_streaming() {
            let input = tokio::select! {
                line = lines.next_line() => Input::Line(line),
                progress = controller.pump() => Input::Progress(progress),
            };
            match input {
                Input::Line(line) => line.context(ReadInputSnafu {
                    stage: "read-command",
                })?,
                Input::Progress(progress) => {
                    render_progress(controller, progress)?;
                    continue;
                }
            }
        } else {
            lines
                .next_line()
                .await
                .context(ReadInputSnafu { stage: "read-prompt" })?
        };

        let Some(line) = line else {
            // Input closed: let a running answer finish before exiting.
            while controller.is_streaming() {
                let progress = controller.pump().await;
                render_progress(controller, progress)?;
            }
            return Ok(());
        };

        let Some(command) = Command::parse(&line) else {
            continue;
        };

        match command {
            Command::Submit(text) => {
                if !controller.submit(&text) {
                    eprintln!("a response is still streaming; use /stop to interrupt it");
                }
            }
            Command::Stop => {
                if let Some(flushed) = controller.stop() {
                    println!("{flushed}");
                    eprintln!("[stopped]");
                }
            }
            Command::Regenerate => {
                if !controller.regenerate() {
                    eprintln!("nothing to regenerate");
                }
            }
            Command::NewSession => {
                let session_id = controller.new_session();
                eprintln!("started session {session_id}");
            }
            Command::History => print_history(controller)?,
            Command::Quit => {
                controller.stop();
                return Ok(());
            }
            Command::Unknown(name) => eprintln!("unknown command {name}"),
        }
    }
}

fn render_progress(controller: &ChatController, progress: TurnProgress) -> Result<(), CliError> {
    let mut stdout = std::io::stdout().lock();
    match progress {
        TurnProgress::Idle => {}
        TurnProgress::Delta(text) => {
            write!(stdout, "{text}").context(WriteOutputSnafu {
                stage: "write-delta",
            })?;
        }
        TurnProgress::Finished(TurnOutcome::Completed | TurnOutcome::Cancelled) => {
            writeln!(stdout).context(WriteOutputSnafu {
                stage: "finish-response",
            })?;
        }
        TurnProgress::Finished(TurnOutcome::Failed(_)) => {
            let fallback = controller
                .log()
                .last()
                .map(|turn| turn.content.as_str())
                .unwrap_or_default();
            writeln!(stdout, "\n{fallback}").context(WriteOutputSnafu {
                stage: "write-fallback",
            })?;
        }
    }

    stdout.flush().context(WriteOutputSnafu {
        stage: "flush-stdout",
    })
}

fn print_history(controller: &ChatController) -> Result<(), CliError> {
    let snapshot = controller.snapshot();
    let mut stdout = std::io::stdout().lock();

    writeln!(stdout, "session {}", snapshot.session_id).context(WriteOutputSnafu {
        stage: "write-history",
    })?;
    for turn in &snapshot.turns {
        let speaker = match turn.role {
            Role::User => "you",
            Role::Assistant => "medigraph",
        };
        writeln!(stdout, "{speaker}: {}", turn.content).context(WriteOutputSnafu {
            stage: "write-history",
        })?;
    }
    Ok(())
}
