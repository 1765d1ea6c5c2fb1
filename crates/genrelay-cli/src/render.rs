//! Terminal rendering of relay events.
//!
//! Assistant text goes out as-is; everything else becomes a bracketed note
//! on its own line.

use std::io::{self, Write};

use genrelay_core::api::StatusResponse;
use genrelay_core::event::{EventPayload, RelayEvent};

/// Write one event. `verbose` adds tool results and the result record.
pub fn event(out: &mut impl Write, event: &RelayEvent, verbose: bool) -> io::Result<()> {
    match &event.payload {
        EventPayload::Text { text } => write!(out, "{text}")?,
        EventPayload::ToolUse { name, .. } => writeln!(out, "\n[tool: {name}]")?,
        EventPayload::EditResult { file_path, patch, .. } => {
            writeln!(out, "[edit: {file_path} ({} hunk(s))]", patch.len())?;
        }
        EventPayload::BashResult {
            command,
            stdout,
            stderr,
            exit_code,
            ..
        } => {
            writeln!(out, "[bash: {command} (exit {exit_code})]")?;
            if verbose {
                write_block(out, stdout)?;
                write_block(out, stderr)?;
            }
        }
        EventPayload::ToolOutput { output, .. } => {
            if let (true, Some(output)) = (verbose, output) {
                write_block(out, output)?;
            }
        }
        EventPayload::Result {
            context_percent,
            cost_usd,
            duration_ms,
            ..
        } => {
            if verbose {
                let cost = cost_usd.map_or_else(String::new, |c| format!(", ${c:.4}"));
                writeln!(
                    out,
                    "\n[context {context_percent:.1}%, {duration_ms} ms{cost}]"
                )?;
            }
        }
        EventPayload::Error { message } => writeln!(out, "\n[error: {message}]")?,
        EventPayload::Done { .. } => writeln!(out)?,
        EventPayload::Init { .. } => {}
    }
    out.flush()
}

fn write_block(out: &mut impl Write, text: &str) -> io::Result<()> {
    let text = text.trim_end();
    if text.is_empty() {
        return Ok(());
    }
    for line in text.lines() {
        writeln!(out, "  | {line}")?;
    }
    Ok(())
}

/// Short status summary for `genrelay status`.
pub fn status(out: &mut impl Write, response_id: &str, status: &StatusResponse) -> io::Result<()> {
    writeln!(out, "Response:  {response_id}")?;
    writeln!(out, "Session:   {} (epoch {})", status.session_id, status.epoch)?;
    writeln!(out, "Status:    {}", status.status.as_str())?;
    writeln!(out, "Events:    {}", status.events.len())?;
    if let Some(percent) = status.context_percent {
        writeln!(out, "Context:   {percent:.1}%")?;
    }
    if let Some(ref error) = status.error {
        writeln!(out, "Error:     {error}")?;
    }
    if let Some(ref text) = status.final_result {
        writeln!(out, "\n{text}")?;
    }
    Ok(())
}
