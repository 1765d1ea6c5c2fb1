//! Replay-then-follow subscription over a response log.

use std::sync::Arc;

use genrelay_core::event::RelayEvent;
use tokio_stream::Stream;

use super::ResponseSlot;

/// Stream the events of `slot` with `idx >= start_from`.
///
/// Buffered events are replayed first, then live appends follow in order. The
/// stream ends after a terminal event, or once the log is closed and drained.
/// Dropping the stream has no effect on the generation.
pub fn subscribe(
    slot: Arc<ResponseSlot>,
    start_from: u64,
) -> impl Stream<Item = RelayEvent> + Send + 'static {
    let mut changed = slot.watch();
    async_stream::stream! {
        let mut cursor = start_from;
        loop {
            // Mark seen before reading so an append after the read wakes us.
            changed.mark_unchanged();
            let (events, closed) = slot.events_from(cursor).await;
            for event in events {
                cursor = event.idx + 1;
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    return;
                }
            }
            if closed || changed.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::registry::ResponseRegistry;
    use genrelay_core::event::{EventPayload, ResponseStatus};
    use std::time::Duration;
    use tokio_stream::StreamExt;

    fn text(i: u64) -> EventPayload {
        EventPayload::Text {
            text: format!("chunk {i}"),
        }
    }

    fn done() -> EventPayload {
        EventPayload::Done {
            final_message_id: None,
        }
    }

    async fn collect(slot: Arc<ResponseSlot>, start: u64) -> Vec<u64> {
        let stream = subscribe(slot, start);
        tokio::time::timeout(Duration::from_secs(2), stream.map(|e| e.idx).collect::<Vec<_>>())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn replays_suffix_from_start() {
        let registry = ResponseRegistry::new(Duration::from_secs(600));
        let slot = registry.create("r1", "s", "chat").await;
        for i in 0..4 {
            slot.append(text(i)).await;
        }
        slot.append(done()).await;

        assert_eq!(collect(Arc::clone(&slot), 0).await, vec![0, 1, 2, 3, 4]);
        assert_eq!(collect(Arc::clone(&slot), 3).await, vec![3, 4]);
        assert!(collect(slot, 10).await.is_empty());
    }

    #[tokio::test]
    async fn follows_live_appends_then_closes() {
        let registry = ResponseRegistry::new(Duration::from_secs(600));
        let slot = registry.create("r1", "s", "chat").await;
        slot.append(text(0)).await;

        let reader = tokio::spawn(collect(Arc::clone(&slot), 0));
        let second = tokio::spawn(collect(Arc::clone(&slot), 1));

        for i in 1..5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            slot.append(text(i)).await;
        }
        slot.append(done()).await;

        assert_eq!(reader.await.unwrap(), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(second.await.unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn terminal_status_without_event_closes_stream() {
        let registry = ResponseRegistry::new(Duration::from_secs(600));
        let slot = registry.create("r1", "s", "chat").await;
        slot.append(text(0)).await;

        let reader = tokio::spawn(collect(Arc::clone(&slot), 0));
        tokio::time::sleep(Duration::from_millis(10)).await;
        slot.mark_terminal(ResponseStatus::Error, Some("lost".into()))
            .await;

        assert_eq!(reader.await.unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn reconnect_reproduces_transcript_once() {
        let registry = ResponseRegistry::new(Duration::from_secs(600));
        let slot = registry.create("r1", "s", "chat").await;
        for i in 0..10 {
            slot.append(text(i)).await;
        }
        slot.append(done()).await;

        let first: Vec<u64> = subscribe(Arc::clone(&slot), 0)
            .take(5)
            .map(|e| e.idx)
            .collect()
            .await;
        let rest = collect(slot, 5).await;

        let mut all = first;
        all.extend(rest);
        assert_eq!(all, (0..=10).collect::<Vec<_>>());
    }
}
