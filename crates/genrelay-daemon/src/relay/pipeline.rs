//! Generation worker: subprocess stdout → NDJSON → `EventBridge` → response log.
//!
//! Data flow:
//! ```text
//! claude stdout → LineFramer → parse_line → EventBridge → ResponseSlot::append
//! result record + exit status → transcript store → terminal event
//! ```

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use genrelay_core::event::{EventPayload, RelayEvent, ResponseStatus};
use genrelay_core::ndjson::{self, LineFramer};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::ResponseSlot;
use crate::session::{LockToken, SessionLocks};
use crate::storage::TranscriptStore;
use crate::subprocess::{
    ClaudeProcess, EventBridge, ResultSummary, SpawnConfig, SubprocessManager,
};

use super::types::STOPPED_MESSAGE;

/// Size of one stdout read.
const READ_BUF_SIZE: usize = 8192;

/// Lease renewals never happen more often than this.
const MIN_HEARTBEAT: Duration = Duration::from_secs(1);

/// Collaborators shared by every worker.
#[derive(Clone)]
pub(super) struct WorkerContext {
    pub locks: Arc<SessionLocks>,
    pub store: Arc<dyn TranscriptStore>,
    pub manager: Arc<SubprocessManager>,
    pub lease: Duration,
}

/// One accepted submission, ready to run.
pub(super) struct Generation {
    pub slot: Arc<ResponseSlot>,
    pub lock: LockToken,
    pub spawn: SpawnConfig,
}

/// How a generation ended.
struct Ending {
    payload: EventPayload,
    status: ResponseStatus,
    /// Process still to be terminated once the response is finished.
    leftover: Option<ClaudeProcess>,
}

impl Ending {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            payload: EventPayload::error(message),
            status: ResponseStatus::Error,
            leftover: None,
        }
    }

    fn stopped(leftover: Option<ClaudeProcess>) -> Self {
        Self {
            payload: EventPayload::error(STOPPED_MESSAGE),
            status: ResponseStatus::Stopped,
            leftover,
        }
    }
}

/// Run one generation to its terminal state and release its session lock.
pub(super) async fn run_generation(ctx: WorkerContext, job: Generation) {
    let Generation { slot, lock, spawn } = job;
    let cancel = slot.cancel_token().clone();

    let ending = if cancel.is_cancelled() {
        Ending::stopped(None)
    } else {
        slot.mark_running().await;
        drive(&ctx, &slot, &lock, spawn, &cancel).await
    };

    let Ending {
        payload,
        status,
        leftover,
    } = ending;
    finish(&ctx.locks, &slot, &lock, payload, status).await;

    if let Some(mut process) = leftover {
        process.terminate().await;
    }
}

/// Seal the response, release the session, then wake subscribers.
pub(super) async fn finish(
    locks: &SessionLocks,
    slot: &ResponseSlot,
    lock: &LockToken,
    payload: EventPayload,
    status: ResponseStatus,
) {
    let response_id = &slot.meta().response_id;
    if slot.finish(payload, status).await.is_none() {
        debug!(%response_id, "Response was already finished");
    }
    locks.release(lock).await;
    slot.notify();
    info!(%response_id, session_id = %slot.meta().session_id, %status, "Generation finished");
}

async fn drive(
    ctx: &WorkerContext,
    slot: &ResponseSlot,
    lock: &LockToken,
    spawn: SpawnConfig,
    cancel: &CancellationToken,
) -> Ending {
    let meta = slot.meta();
    let mut process = match ctx.manager.spawn(spawn).await {
        Ok(process) => process,
        Err(e) => {
            warn!(response_id = %meta.response_id, error = %e, "Spawn failed");
            return Ending::failed(e.to_string());
        }
    };
    info!(
        response_id = %meta.response_id,
        process_id = process.id(),
        "Generation running"
    );

    let mut bridge = EventBridge::new();
    let mut framer = LineFramer::new();
    let mut transcript: Vec<RelayEvent> = Vec::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    let mut heartbeat = tokio::time::interval(heartbeat_period(ctx.lease));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.reset();

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!(response_id = %meta.response_id, "Stop requested");
                return Ending::stopped(Some(process));
            }
            _ = heartbeat.tick() => {
                if !ctx.locks.renew(lock).await {
                    warn!(response_id = %meta.response_id, "Session lock lost while running");
                }
            }
            read = process.read_chunk(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    for line in framer.push(&buf[..n]) {
                        relay_line(&line, &mut bridge, slot, &mut transcript).await;
                    }
                    ctx.locks.renew(lock).await;
                }
                Err(e) => {
                    warn!(response_id = %meta.response_id, error = %e, "Stdout read failed");
                    break;
                }
            }
        }
    }

    if let Some(line) = framer.finish() {
        relay_line(&line, &mut bridge, slot, &mut transcript).await;
    }

    // The process may outlive its stdout. It still holds the session until it exits.
    let exit = loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!(response_id = %meta.response_id, "Stop requested after output ended");
                return Ending::stopped(Some(process));
            }
            _ = heartbeat.tick() => {
                if !ctx.locks.renew(lock).await {
                    warn!(response_id = %meta.response_id, "Session lock lost while exiting");
                }
            }
            exit = process.wait() => break exit,
        }
    };
    if cancel.is_cancelled() {
        return Ending::stopped(None);
    }

    let exited_ok = matches!(&exit, Ok(status) if status.success());
    match bridge.result().cloned() {
        Some(ResultSummary {
            error: Some(error), ..
        }) => Ending::failed(error),
        Some(summary) if exited_ok => {
            let content = bridge.final_text().to_string();
            let final_message_id = persist(ctx, slot, &content, &transcript).await;
            if summary.context_percent > 0.0 {
                if let Err(e) = ctx
                    .store
                    .update_context(&meta.session_id, summary.context_percent)
                    .await
                {
                    warn!(session_id = %meta.session_id, error = %e, "Context not stored");
                }
            }
            slot.set_final_result(content).await;
            Ending {
                payload: EventPayload::Done { final_message_id },
                status: ResponseStatus::Completed,
                leftover: None,
            }
        }
        summary => {
            let tail = process.stderr_tail().await;
            Ending::failed(describe_exit(exit.as_ref().ok(), summary.is_some(), &tail))
        }
    }
}

/// Decode one record and append its events to the response log.
async fn relay_line(
    line: &str,
    bridge: &mut EventBridge,
    slot: &ResponseSlot,
    transcript: &mut Vec<RelayEvent>,
) {
    let message = match ndjson::parse_line(line) {
        Ok(message) => message,
        Err(e) => {
            warn!(
                response_id = %slot.meta().response_id,
                error = %e,
                "Skipping undecodable record"
            );
            return;
        }
    };

    for payload in bridge.convert(message) {
        let kept = payload.is_transcript().then(|| payload.clone());
        if let Some(idx) = slot.append(payload).await {
            if let Some(payload) = kept {
                transcript.push(RelayEvent::new(idx, payload));
            }
        }
    }
}

async fn persist(
    ctx: &WorkerContext,
    slot: &ResponseSlot,
    content: &str,
    transcript: &[RelayEvent],
) -> Option<i64> {
    if content.is_empty() && transcript.is_empty() {
        return None;
    }
    let session_id = &slot.meta().session_id;
    match ctx.store.save_assistant(session_id, content, transcript).await {
        Ok(id) => Some(id),
        Err(e) => {
            warn!(%session_id, error = %e, "Assistant message not stored");
            None
        }
    }
}

fn heartbeat_period(lease: Duration) -> Duration {
    (lease / 3).max(MIN_HEARTBEAT)
}

fn describe_exit(status: Option<&ExitStatus>, had_result: bool, stderr: &[String]) -> String {
    let exit = status.map_or_else(|| "unknown status".to_string(), ToString::to_string);
    let mut message = if had_result {
        format!("Process exited ({exit})")
    } else {
        format!("Process exited ({exit}) without a result")
    };
    if !stderr.is_empty() {
        message.push_str(": ");
        message.push_str(&stderr.join("\n"));
    }
    message
}
