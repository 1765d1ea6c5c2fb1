//! genrelay CLI
//!
//! Submits generations to the relay daemon and follows their event streams,
//! surviving disconnects through the resume contract.

use std::io::{self, Write};

use clap::{Parser, Subcommand};
use genrelay_core::api::{FileSubstitutions, GenerateRequest, StopRequest};
use genrelay_core::event::EventPayload;
use genrelay_core::resume::ResumeTicket;
use tracing::info;

use genrelay_cli::client::{DEFAULT_URL, RelayApi, RelayClient};
use genrelay_cli::follow::{self, FollowOutcome, ReconnectPolicy};
use genrelay_cli::render;

#[derive(Parser, Debug)]
#[command(name = "genrelay")]
#[command(version, about = "Client for the genrelay daemon", long_about = None)]
struct Cli {
    /// Daemon base URL
    #[arg(long, env = "GENRELAY_URL", default_value = DEFAULT_URL)]
    url: String,

    /// Emit logs as JSON
    #[arg(long, env = "GENRELAY_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a message and stream the answer
    Ask {
        /// Message text
        message: String,
        /// Session name within the mode
        #[arg(short, long, default_value = "default")]
        session: String,
        /// Mode (chat, code, paper, ...)
        #[arg(short, long)]
        mode: Option<String>,
        /// Model alias (haiku, sonnet, opus)
        #[arg(long)]
        model: Option<String>,
        /// Enabled MCP tool names (repeatable)
        #[arg(long = "tool")]
        tools: Vec<String>,
        /// File substitutions as `short:saved,short2:saved2`
        #[arg(long)]
        files: Option<String>,
        /// Print the ids and return without following
        #[arg(long)]
        detach: bool,
        /// Show tool output and usage
        #[arg(short, long)]
        verbose: bool,
    },
    /// Follow an existing response
    Watch {
        /// Response ID
        response_id: String,
        /// First event index to show
        #[arg(long, default_value_t = 0)]
        from: u64,
        /// Show tool output and usage
        #[arg(short, long)]
        verbose: bool,
    },
    /// Show a response's status
    Status {
        /// Response ID
        response_id: String,
        /// Print the raw JSON body
        #[arg(long)]
        json: bool,
    },
    /// List active responses
    Active {
        /// Session key (`<mode>_<name>`)
        #[arg(short, long)]
        session: Option<String>,
    },
    /// Stop active generations of a session or a mode
    Stop {
        /// Session key (`<mode>_<name>`)
        #[arg(short, long, conflicts_with = "mode")]
        session: Option<String>,
        /// Mode name
        #[arg(short, long)]
        mode: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    genrelay_core::tracing_init::init_tracing("genrelay_cli=warn", cli.log_json);
    info!(version = env!("CARGO_PKG_VERSION"), url = %cli.url, "Starting genrelay CLI");

    let client = RelayClient::new(&cli.url)?;
    let mut out = io::stdout();
    let mut err = io::stderr();

    match cli.command {
        Command::Ask {
            message,
            session,
            mode,
            model,
            tools,
            files,
            detach,
            verbose,
        } => {
            let request = GenerateRequest {
                message,
                session_id: session,
                mode,
                model,
                enabled_tool_names: tools,
                file_substitutions: files
                    .map_or_else(FileSubstitutions::default, FileSubstitutions::Inline),
            };
            let accepted = match client.generate(&request).await {
                Ok(accepted) => accepted,
                Err(e) if e.is_lock_busy() => {
                    anyhow::bail!("{e}\nUse `genrelay stop --session <key>` to cancel it.")
                }
                Err(e) => return Err(e.into()),
            };
            writeln!(
                err,
                "[response {} | session {} | epoch {}]",
                accepted.response_id, accepted.session_id, accepted.epoch
            )?;
            if detach {
                writeln!(out, "{}", accepted.response_id)?;
                return Ok(());
            }
            let ticket = ResumeTicket {
                session_id: accepted.session_id,
                response_id: accepted.response_id,
                epoch: accepted.epoch,
            };
            run_follow(&client, &ticket, 0, verbose).await?;
        }
        Command::Watch {
            response_id,
            from,
            verbose,
        } => {
            let Some(status) = client.status(&response_id).await? else {
                anyhow::bail!("Response {response_id} not found");
            };
            let ticket = ResumeTicket {
                session_id: status.session_id,
                response_id,
                epoch: status.epoch,
            };
            run_follow(&client, &ticket, from, verbose).await?;
        }
        Command::Status { response_id, json } => match client.status(&response_id).await? {
            Some(status) if json => writeln!(out, "{}", serde_json::to_string_pretty(&status)?)?,
            Some(status) => render::status(&mut out, &response_id, &status)?,
            None => writeln!(out, "Response {response_id} not found.")?,
        },
        Command::Active { session } => {
            let active = match session.as_deref() {
                Some(session) => client.active(session).await?,
                None => client.active_all().await?,
            };
            if active.active.is_empty() {
                writeln!(out, "No active responses.")?;
            }
            for id in &active.active {
                writeln!(out, "{id}")?;
            }
            if let Some(epoch) = active.epoch {
                writeln!(err, "[epoch {epoch}]")?;
            }
        }
        Command::Stop { session, mode } => {
            if session.is_none() && mode.is_none() {
                anyhow::bail!("Pass --session or --mode");
            }
            let stopped = client
                .stop(&StopRequest {
                    session_id: session,
                    mode,
                })
                .await?;
            writeln!(out, "Cancelled {} generation(s).", stopped.cancelled)?;
        }
    }
    Ok(())
}

/// Follow `ticket` to the end, printing events as they arrive.
async fn run_follow(
    client: &RelayClient,
    ticket: &ResumeTicket,
    start_from: u64,
    verbose: bool,
) -> anyhow::Result<()> {
    let mut out = io::stdout();
    let mut write_failed = None;
    let outcome = follow::follow(
        client,
        ticket,
        start_from,
        &ReconnectPolicy::default(),
        |event| {
            if write_failed.is_none() {
                if let Err(e) = render::event(&mut out, event, verbose) {
                    write_failed = Some(e);
                }
            }
        },
    )
    .await?;
    if let Some(e) = write_failed {
        return Err(e.into());
    }

    match outcome {
        FollowOutcome::Finished(EventPayload::Error { message }) => {
            anyhow::bail!("Generation failed: {message}")
        }
        FollowOutcome::Finished(_) => Ok(()),
        FollowOutcome::Rejected(message) => anyhow::bail!("Stream refused: {message}"),
        FollowOutcome::Discarded => {
            anyhow::bail!("Response {} was superseded by a newer one", ticket.response_id)
        }
    }
}
