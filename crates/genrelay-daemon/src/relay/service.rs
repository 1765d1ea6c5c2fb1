//! The generation relay service.

use std::sync::Arc;
use std::time::Duration;

use genrelay_core::api::{
    ActiveQuery, ActiveResponse, ClearResponse, CommandsResponse, ContextResponse,
    GenerateRequest, GenerateResponse, MessagesResponse, SavedCommand, StatusResponse,
    StopRequest, StopResponse,
};
use genrelay_core::config::Config;
use genrelay_core::event::{EventPayload, RelayEvent, ResponseStatus};
use tokio_stream::Stream;
use tracing::{info, warn};

use crate::registry::{self, ResponseRegistry};
use crate::session::SessionLocks;
use crate::storage::TranscriptStore;
use crate::subprocess::{Conversation, PermissionStrategy, SpawnConfig, SubprocessManager};

use super::pipeline::{self, Generation, WorkerContext};
use super::pool::{PoolError, WorkerPool};
use super::prompt::{expand_commands, is_valid_name, mcp_flags, session_key, substitute_files};
use super::types::{RelayError, RelayOptions, STOPPED_MESSAGE, StreamRejection};

/// How long a stop or an eviction waits for a response to reach a terminal status.
const STOP_SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

/// Accepts generation requests and runs them on the worker pool.
///
/// At most one generation runs per session. Submissions never wait for the
/// generation itself; progress is read back through [`subscribe`](Self::subscribe)
/// and [`status`](Self::status).
pub struct GenerationRelay {
    config: Config,
    registry: Arc<ResponseRegistry>,
    pool: WorkerPool,
    worker: WorkerContext,
    options: RelayOptions,
}

impl GenerationRelay {
    pub fn new(config: Config, store: Arc<dyn TranscriptStore>) -> Self {
        let relay = &config.relay;
        let strategy = if relay.skip_permissions {
            PermissionStrategy::SkipPermissions
        } else {
            PermissionStrategy::AllowedTools(relay.allowed_tools.clone())
        };
        let manager = SubprocessManager::with_options(
            relay.claude_bin.clone(),
            strategy,
            relay.terminate_timeout_secs,
        );
        let options = RelayOptions {
            lock_lease: relay.lock_lease(),
            partial_messages: relay.partial_messages,
            uploads_dir: relay.uploads_dir(),
            attachments_dir: relay.attachments_dir(),
        };

        Self {
            registry: Arc::new(ResponseRegistry::new(relay.retention())),
            pool: WorkerPool::new(relay.max_generations),
            worker: WorkerContext {
                locks: Arc::new(SessionLocks::new(relay.lock_wait())),
                store,
                manager: Arc::new(manager),
                lease: options.lock_lease,
            },
            options,
            config,
        }
    }

    pub const fn registry(&self) -> &Arc<ResponseRegistry> {
        &self.registry
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Start a generation and return its ids without waiting for it.
    pub async fn submit(&self, request: GenerateRequest) -> Result<GenerateResponse, RelayError> {
        if request.message.trim().is_empty() {
            return Err(RelayError::InvalidRequest("message is required".into()));
        }
        let name = request.session_id.trim();
        if name.is_empty() {
            return Err(RelayError::InvalidRequest("session_id is required".into()));
        }
        if !is_valid_name(name) {
            return Err(RelayError::InvalidRequest(format!(
                "invalid session name: {name}"
            )));
        }
        let mode_name = request.mode();
        let mode = self
            .config
            .modes
            .get(mode_name)
            .ok_or_else(|| RelayError::UnknownMode(mode_name.to_string()))?;
        let model = self.config.sessions.resolve_model(request.model.as_deref());
        let session_id = session_key(mode_name, name);

        let permit = self.pool.try_acquire().map_err(|e| match e {
            PoolError::Exhausted { max } => RelayError::PoolExhausted { max },
            PoolError::Closed => RelayError::ShuttingDown,
        })?;
        let message = expand_commands(&request.message, self.worker.store.as_ref()).await?;

        let response_id = uuid::Uuid::new_v4().to_string();
        let grant = self
            .worker
            .locks
            .acquire(&session_id, &response_id, self.options.lock_lease)
            .await?;
        if let Some(evicted) = &grant.evicted {
            self.retire_evicted(evicted).await;
        }

        let slot = self
            .registry
            .create(&response_id, &session_id, mode_name)
            .await;
        let epoch = slot.meta().epoch;

        let turn = match self
            .worker
            .store
            .begin_turn(&session_id, mode_name, &message)
            .await
        {
            Ok(turn) => turn,
            Err(e) => {
                pipeline::finish(
                    &self.worker.locks,
                    &slot,
                    &grant.token,
                    EventPayload::error(e.to_string()),
                    ResponseStatus::Error,
                )
                .await;
                return Err(e.into());
            }
        };

        let prompt = substitute_files(
            &message,
            &request.file_substitutions.pairs(),
            &self.options.uploads_dir,
            &self.options.attachments_dir,
        )
        .await;
        let flags = mcp_flags(
            &self.config.mcp_servers,
            mode_name,
            &request.enabled_tool_names,
        );
        let conversation = if turn.is_first {
            Conversation::New(turn.cli_session_id)
        } else {
            Conversation::Resume(turn.cli_session_id)
        };

        let mut spawn = SpawnConfig::new(prompt, conversation, model);
        spawn.working_directory = mode.session_dir(name);
        spawn.system_prompt.clone_from(&mode.system_prompt);
        spawn.tools.clone_from(&mode.tools);
        spawn.mcp_configs = flags.configs;
        spawn.disallowed_tools = flags.disallowed_tools;
        spawn.partial_messages = self.options.partial_messages;

        let job = Generation {
            slot: Arc::clone(&slot),
            lock: grant.token.clone(),
            spawn,
        };
        let locks = Arc::clone(&self.worker.locks);
        let token = grant.token;
        self.pool.spawn(
            permit,
            response_id.clone(),
            pipeline::run_generation(self.worker.clone(), job),
            move |reason| async move {
                pipeline::finish(
                    &locks,
                    &slot,
                    &token,
                    EventPayload::error(format!("Generation failed: {reason}")),
                    ResponseStatus::Error,
                )
                .await;
            },
        );

        info!(%response_id, %session_id, epoch, "Generation accepted");
        Ok(GenerateResponse {
            response_id,
            session_id,
            epoch,
        })
    }

    /// Stop the response whose expired lease was just reclaimed.
    ///
    /// Its worker gets a bounded wait to settle. A response still open after
    /// that is closed as stopped so the session never shows two running.
    async fn retire_evicted(&self, response_id: &str) {
        let Some(stale) = self.registry.get(response_id).await else {
            return;
        };
        stale.cancel_token().cancel();
        if tokio::time::timeout(STOP_SETTLE_TIMEOUT, stale.settled())
            .await
            .is_err()
        {
            warn!(%response_id, "Evicted response has not settled, closing it");
            stale
                .finish(EventPayload::error(STOPPED_MESSAGE), ResponseStatus::Stopped)
                .await;
            stale.notify();
        }
    }

    /// Cancel active generations of a session, or of every session in a mode.
    pub async fn stop(&self, request: &StopRequest) -> Result<StopResponse, RelayError> {
        let session_id = request.session_id.as_deref().filter(|s| !s.is_empty());
        let mode = request.mode.as_deref().filter(|m| !m.is_empty());
        let targets = match (session_id, mode) {
            (Some(session_id), _) => self.registry.active_for_session(Some(session_id)).await,
            (None, Some(mode)) => self.registry.active_for_mode(mode).await,
            (None, None) => {
                return Err(RelayError::InvalidRequest(
                    "session_id or mode is required".into(),
                ));
            }
        };

        let mut cancelled = 0;
        for slot in &targets {
            if !slot.cancel_token().is_cancelled() {
                slot.cancel_token().cancel();
                cancelled += 1;
            }
        }
        for slot in &targets {
            if tokio::time::timeout(STOP_SETTLE_TIMEOUT, slot.settled())
                .await
                .is_err()
            {
                warn!(response_id = %slot.meta().response_id, "Stopped response has not settled");
            }
        }

        info!(?session_id, ?mode, cancelled, "Stop request handled");
        Ok(StopResponse { cancelled })
    }

    pub async fn status(&self, response_id: &str) -> Option<StatusResponse> {
        self.registry.snapshot(response_id).await
    }

    /// Active responses, for one session or for all of them.
    pub async fn active(&self, query: &ActiveQuery) -> ActiveResponse {
        let session_id = query.session_id.as_deref().filter(|s| !s.is_empty());
        let active = self
            .registry
            .active_for_session(session_id)
            .await
            .iter()
            .map(|slot| slot.meta().response_id.clone())
            .collect();
        let epoch = match session_id {
            Some(session_id) => self.registry.current_epoch(session_id).await,
            None => None,
        };
        ActiveResponse { active, epoch }
    }

    /// Events of a response from `start_from` on, following live appends.
    ///
    /// A subscription carrying an epoch other than the response's is stale.
    pub async fn subscribe(
        &self,
        response_id: &str,
        start_from: u64,
        epoch: Option<u64>,
    ) -> Result<impl Stream<Item = RelayEvent> + Send + 'static + use<>, StreamRejection> {
        let slot = self
            .registry
            .get(response_id)
            .await
            .ok_or(StreamRejection::NotFound)?;
        if epoch.is_some_and(|epoch| epoch != slot.meta().epoch) {
            return Err(StreamRejection::StaleEpoch);
        }
        Ok(registry::subscribe(slot, start_from))
    }

    /// Forget a session's conversation. Refused while a generation holds it.
    pub async fn clear(&self, session_id: &str) -> Result<ClearResponse, RelayError> {
        let session_id = required_session(session_id)?;
        if let Some(response_id) = self.worker.locks.holder(session_id).await {
            return Err(RelayError::LockBusy {
                session_id: session_id.to_string(),
                response_id,
            });
        }
        let deleted_messages = self.worker.store.clear(session_id).await?;
        info!(session_id, deleted_messages, "Session cleared");
        Ok(ClearResponse {
            session_id: session_id.to_string(),
            deleted_messages,
        })
    }

    pub async fn context(&self, session_id: &str) -> Result<ContextResponse, RelayError> {
        let session_id = required_session(session_id)?;
        Ok(ContextResponse {
            session_id: session_id.to_string(),
            context_percent: self.worker.store.context_percent(session_id).await?,
        })
    }

    pub async fn messages(&self, session_id: &str) -> Result<MessagesResponse, RelayError> {
        let session_id = required_session(session_id)?;
        Ok(MessagesResponse {
            session_id: session_id.to_string(),
            messages: self.worker.store.messages(session_id).await?,
        })
    }

    pub async fn commands(&self) -> Result<CommandsResponse, RelayError> {
        Ok(CommandsResponse {
            commands: self.worker.store.commands().await?,
        })
    }

    /// Create or replace the command inserted by `{{cmd:<name>}}`.
    pub async fn save_command(&self, name: &str, content: &str) -> Result<SavedCommand, RelayError> {
        if !is_valid_name(name) {
            return Err(RelayError::InvalidRequest(format!(
                "invalid command name: {name}"
            )));
        }
        if content.trim().is_empty() {
            return Err(RelayError::InvalidRequest("content is required".into()));
        }
        let saved = self.worker.store.save_command(name, content).await?;
        info!(command = name, "Command saved");
        Ok(saved)
    }

    pub async fn delete_command(&self, name: &str) -> Result<(), RelayError> {
        if self.worker.store.delete_command(name).await? {
            info!(command = name, "Command deleted");
            Ok(())
        } else {
            Err(RelayError::CommandNotFound(name.to_string()))
        }
    }

    /// Refuse new work, stop everything in flight and wait for the workers.
    pub async fn shutdown(&self) {
        let active = self.registry.active_for_session(None).await;
        info!(active = active.len(), "Relay shutting down");
        for slot in &active {
            slot.cancel_token().cancel();
        }
        self.pool.shutdown().await;
    }
}

fn required_session(session_id: &str) -> Result<&str, RelayError> {
    let session_id = session_id.trim();
    if session_id.is_empty() {
        return Err(RelayError::InvalidRequest("session_id is required".into()));
    }
    Ok(session_id)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use genrelay_core::config::ModeConfig;
    use tokio_stream::StreamExt;

    async fn relay_with(dir: &std::path::Path, claude_bin: &str) -> GenerationRelay {
        let mut config = Config::default();
        config.relay.claude_bin = claude_bin.into();
        config.relay.uploads_dir = Some(dir.join("uploads"));
        config.relay.attachments_dir = Some(dir.join("attachments"));
        for mode in config.modes.values_mut() {
            mode.work_dir = dir.join("work");
        }
        config.modes.insert(
            "code".into(),
            ModeConfig {
                work_dir: dir.join("work"),
                per_session_dir: true,
                system_prompt: None,
                tools: None,
            },
        );
        let db = Database::open_in_memory().await.unwrap();
        GenerationRelay::new(config, Arc::new(db))
    }

    fn request(name: &str, message: &str) -> GenerateRequest {
        serde_json::from_value(serde_json::json!({
            "message": message,
            "session_id": name,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn rejects_invalid_requests() {
        let dir = tempfile::tempdir().unwrap();
        let relay = relay_with(dir.path(), "claude").await;

        assert!(matches!(
            relay.submit(request("a", "   ")).await,
            Err(RelayError::InvalidRequest(_))
        ));
        assert!(matches!(
            relay.submit(request("", "hi")).await,
            Err(RelayError::InvalidRequest(_))
        ));
        assert!(matches!(
            relay.submit(request("../x", "hi")).await,
            Err(RelayError::InvalidRequest(_))
        ));

        let mut unknown = request("a", "hi");
        unknown.mode = Some("poetry".into());
        assert!(matches!(
            relay.submit(unknown).await,
            Err(RelayError::UnknownMode(_))
        ));
        assert!(relay.registry().is_empty().await);
    }

    #[tokio::test]
    async fn spawn_failure_is_a_terminal_error() {
        let dir = tempfile::tempdir().unwrap();
        let relay = relay_with(dir.path(), "/nonexistent/claude-binary").await;

        let accepted = relay.submit(request("a", "hello")).await.unwrap();
        assert_eq!(accepted.session_id, "chat_a");
        assert_eq!(accepted.epoch, 1);

        let events: Vec<RelayEvent> = relay
            .subscribe(&accepted.response_id, 0, None)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].payload, EventPayload::Error { .. }));

        let status = relay.status(&accepted.response_id).await.unwrap();
        assert_eq!(status.status, ResponseStatus::Error);
        assert!(status.error.is_some());

        // The lock was released, so the next turn is accepted.
        let next = relay.submit(request("a", "again")).await.unwrap();
        assert_eq!(next.epoch, 2);
    }

    #[tokio::test]
    async fn subscribe_rejects_unknown_and_stale() {
        let dir = tempfile::tempdir().unwrap();
        let relay = relay_with(dir.path(), "/nonexistent/claude-binary").await;

        assert_eq!(
            relay.subscribe("missing", 0, None).await.err(),
            Some(StreamRejection::NotFound)
        );
        let accepted = relay.submit(request("a", "hello")).await.unwrap();
        assert_eq!(
            relay
                .subscribe(&accepted.response_id, 0, Some(accepted.epoch + 1))
                .await
                .err(),
            Some(StreamRejection::StaleEpoch)
        );
        assert!(
            relay
                .subscribe(&accepted.response_id, 0, Some(accepted.epoch))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn stop_requires_a_target() {
        let dir = tempfile::tempdir().unwrap();
        let relay = relay_with(dir.path(), "claude").await;
        assert!(matches!(
            relay.stop(&StopRequest::default()).await,
            Err(RelayError::InvalidRequest(_))
        ));
        let none = StopRequest {
            session_id: Some("chat_idle".into()),
            mode: None,
        };
        assert_eq!(relay.stop(&none).await.unwrap().cancelled, 0);
    }

    #[tokio::test]
    async fn session_maintenance_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let relay = relay_with(dir.path(), "/nonexistent/claude-binary").await;

        let accepted = relay.submit(request("notes", "remember")).await.unwrap();
        relay
            .registry()
            .get(&accepted.response_id)
            .await
            .unwrap()
            .settled()
            .await;

        let messages = relay.messages("chat_notes").await.unwrap();
        assert_eq!(messages.messages.len(), 1);
        assert_eq!(messages.messages[0].role, "user");

        let context = relay.context("chat_notes").await.unwrap();
        assert!(context.context_percent.abs() < f64::EPSILON);

        let cleared = relay.clear("chat_notes").await.unwrap();
        assert_eq!(cleared.deleted_messages, 1);
        assert!(matches!(
            relay.clear(" ").await,
            Err(RelayError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn active_reports_epoch_per_session() {
        let dir = tempfile::tempdir().unwrap();
        let relay = relay_with(dir.path(), "claude").await;
        let query = ActiveQuery {
            session_id: Some("chat_none".into()),
        };
        let active = relay.active(&query).await;
        assert!(active.active.is_empty());
        assert_eq!(active.epoch, None);
    }

    #[cfg(unix)]
    fn sleeping_claude(dir: &std::path::Path) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("claude");
        std::fs::write(&path, "#!/bin/sh\ncat > /dev/null\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn accepted_response_is_active_while_it_holds_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let relay = relay_with(dir.path(), &sleeping_claude(dir.path())).await;

        let accepted = relay.submit(request("a", "hello")).await.unwrap();
        let query = ActiveQuery {
            session_id: Some("chat_a".into()),
        };
        assert_eq!(
            relay.worker.locks.holder("chat_a").await.as_deref(),
            Some(accepted.response_id.as_str())
        );
        assert_eq!(relay.active(&query).await.active, vec![accepted.response_id]);

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn evicted_holder_is_closed_before_the_next_turn() {
        let dir = tempfile::tempdir().unwrap();
        let relay = relay_with(dir.path(), "/nonexistent/claude-binary").await;

        // A holder whose lease lapsed and whose worker never reports back.
        let stale = relay.registry().create("stale", "chat_a", "chat").await;
        stale.mark_running().await;
        relay
            .worker
            .locks
            .acquire("chat_a", "stale", Duration::ZERO)
            .await
            .unwrap();

        let accepted = relay.submit(request("a", "hello")).await.unwrap();
        assert_eq!(accepted.epoch, 2);
        assert!(stale.cancel_token().is_cancelled());

        let status = relay.status("stale").await.unwrap();
        assert_eq!(status.status, ResponseStatus::Stopped);
        assert_eq!(
            status.events.last().map(|e| &e.payload),
            Some(&EventPayload::error(STOPPED_MESSAGE))
        );
        relay
            .registry()
            .get(&accepted.response_id)
            .await
            .unwrap()
            .settled()
            .await;
    }

    #[tokio::test]
    async fn commands_are_validated_and_expanded() {
        let dir = tempfile::tempdir().unwrap();
        let relay = relay_with(dir.path(), "/nonexistent/claude-binary").await;

        assert!(matches!(
            relay.save_command("bad name", "x").await,
            Err(RelayError::InvalidRequest(_))
        ));
        assert!(matches!(
            relay.save_command("empty", "  ").await,
            Err(RelayError::InvalidRequest(_))
        ));
        relay
            .save_command("greet", "Say hello politely.")
            .await
            .unwrap();
        assert_eq!(relay.commands().await.unwrap().commands.len(), 1);

        let accepted = relay
            .submit(request("c", "{{cmd:greet}} Then stop."))
            .await
            .unwrap();
        relay
            .registry()
            .get(&accepted.response_id)
            .await
            .unwrap()
            .settled()
            .await;
        let messages = relay.messages("chat_c").await.unwrap();
        assert_eq!(messages.messages[0].content, "Say hello politely. Then stop.");

        relay.delete_command("greet").await.unwrap();
        assert!(matches!(
            relay.delete_command("greet").await,
            Err(RelayError::CommandNotFound(_))
        ));
    }
}
