//! Debounced batching of rapid-sequential images.
//!
//! A burst of images from one sender in one channel collapses into a single
//! dispatch: the first event is the primary, later media URLs accumulate as
//! extras, and every append pushes the flush timer out again. Flush-due
//! notifications are delivered through the monitor's mailbox so dispatch
//! stays on the session loop.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    tokio::{sync::mpsc, task::JoinHandle},
    tracing::warn,
    url::Url,
};

use crate::{events::MessagePayload, policy};

/// Debounce interval: a group flushes this long after its last image.
pub const DEBOUNCE: Duration = Duration::from_millis(800);

/// Buffer key: one pending group per `channel_id:sender_id`.
#[must_use]
pub fn group_key(channel_id: &str, sender_id: &str) -> String {
    format!("{channel_id}:{sender_id}")
}

/// Notification that a pending group's debounce elapsed.
#[derive(Debug, Clone)]
pub struct FlushDue {
    pub key: String,
    pub generation: u64,
}

/// A buffered image burst ready for one dispatch.
#[derive(Debug, Clone)]
pub struct PendingGroup {
    pub payload: MessagePayload,
    pub channel_id: String,
    pub is_group: bool,
    pub extras: Vec<String>,
}

struct PendingEntry {
    group: PendingGroup,
    generation: u64,
    timer: JoinHandle<()>,
}

/// Outcome of offering an event to the buffer.
#[derive(Debug)]
pub enum BufferOutcome {
    /// Event not buffered; handle it normally.
    Passthrough,
    /// Event not buffered, but it closed an open image group — dispatch the
    /// group first, then handle the event normally.
    PassthroughWithFlush(PendingGroup),
    /// Event absorbed into a pending group.
    Buffered,
}

pub struct MediaGroupBuffer {
    debounce: Duration,
    server: Url,
    flush_tx: mpsc::UnboundedSender<FlushDue>,
    entries: Mutex<HashMap<String, PendingEntry>>,
    generation: AtomicU64,
}

impl MediaGroupBuffer {
    #[must_use]
    pub fn new(server: Url, flush_tx: mpsc::UnboundedSender<FlushDue>) -> Self {
        Self::with_debounce(server, flush_tx, DEBOUNCE)
    }

    #[must_use]
    pub fn with_debounce(
        server: Url,
        flush_tx: mpsc::UnboundedSender<FlushDue>,
        debounce: Duration,
    ) -> Self {
        Self {
            debounce,
            server,
            flush_tx,
            entries: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Offer an event to the buffer.
    ///
    /// Images start or extend a pending group (resetting its timer);
    /// anything else passes through, closing an open group for the same key
    /// first.
    pub fn try_buffer(
        &self,
        key: &str,
        payload: &MessagePayload,
        channel_id: &str,
        is_group: bool,
        media_url: Option<&str>,
        is_image: bool,
    ) -> BufferOutcome {
        let Ok(mut entries) = self.entries.lock() else {
            return BufferOutcome::Passthrough;
        };

        if !is_image {
            if let Some(entry) = entries.remove(key) {
                entry.timer.abort();
                return BufferOutcome::PassthroughWithFlush(entry.group);
            }
            return BufferOutcome::Passthrough;
        }

        if let Some(entry) = entries.get_mut(key) {
            if let Some(url) = media_url {
                if policy::is_safe_media_url(url, &self.server) {
                    entry.group.extras.push(url.to_string());
                } else {
                    warn!(url, "skipping unsafe media url in image group");
                }
            }
            entry.timer.abort();
            entry.generation = self.next_generation();
            entry.timer = self.arm_timer(key.to_string(), entry.generation);
            return BufferOutcome::Buffered;
        }

        let generation = self.next_generation();
        let entry = PendingEntry {
            group: PendingGroup {
                payload: payload.clone(),
                channel_id: channel_id.to_string(),
                is_group,
                extras: Vec::new(),
            },
            generation,
            timer: self.arm_timer(key.to_string(), generation),
        };
        entries.insert(key.to_string(), entry);
        BufferOutcome::Buffered
    }

    /// Remove a pending group whose flush came due. Returns `None` when the
    /// notification is stale (the group was extended or already flushed).
    pub fn take_due(&self, due: &FlushDue) -> Option<PendingGroup> {
        let Ok(mut entries) = self.entries.lock() else {
            return None;
        };
        let current = entries
            .get(&due.key)
            .is_some_and(|entry| entry.generation == due.generation);
        if !current {
            return None;
        }
        let entry = entries.remove(&due.key)?;
        entry.timer.abort();
        Some(entry.group)
    }

    /// Drain every pending group for shutdown, cancelling timers first.
    pub fn dispose(&self) -> Vec<PendingGroup> {
        let Ok(mut entries) = self.entries.lock() else {
            return Vec::new();
        };
        entries
            .drain()
            .map(|(_, entry)| {
                entry.timer.abort();
                entry.group
            })
            .collect()
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn arm_timer(&self, key: String, generation: u64) -> JoinHandle<()> {
        let tx = self.flush_tx.clone();
        let debounce = self.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let _ = tx.send(FlushDue { key, generation });
        })
    }
}

#[cfg(test)]
mod tests {
    use {super::*, tokio::time::Instant};

    fn image_payload(id: &str, url: &str) -> MessagePayload {
        MessagePayload {
            message_id: id.into(),
            author_id: "u1".into(),
            payload: crate::events::MessageContent {
                content_type: Some("image".into()),
                media_url: Some(url.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn server() -> Url {
        Url::parse("https://wrist.example.com").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn burst_flushes_once_after_debounce() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let buffer = MediaGroupBuffer::new(server(), tx);
        let key = group_key("ch-1", "u1");

        let started = Instant::now();
        for (id, url) in [("m1", "/img/1.jpg"), ("m2", "/img/2.jpg"), ("m3", "/img/3.jpg")] {
            let outcome = buffer.try_buffer(
                &key,
                &image_payload(id, url),
                "ch-1",
                false,
                Some(url),
                true,
            );
            assert!(matches!(outcome, BufferOutcome::Buffered));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let due = rx.recv().await.unwrap();
        // 2 × 100 ms between arrivals + 800 ms after the last.
        assert_eq!(started.elapsed(), Duration::from_millis(1100));

        let group = buffer.take_due(&due).unwrap();
        assert_eq!(group.payload.message_id, "m1", "first event is primary");
        assert_eq!(group.extras, vec!["/img/2.jpg", "/img/3.jpg"]);

        // The earlier (reset) timers were aborted or are stale.
        assert!(buffer.take_due(&due).is_none());
        tokio::time::sleep(Duration::from_secs(2)).await;
        while let Ok(stale) = rx.try_recv() {
            assert!(buffer.take_due(&stale).is_none());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn non_image_closes_open_group() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let buffer = MediaGroupBuffer::new(server(), tx);
        let key = group_key("ch-1", "u1");

        buffer.try_buffer(
            &key,
            &image_payload("m1", "/img/1.jpg"),
            "ch-1",
            false,
            Some("/img/1.jpg"),
            true,
        );

        let text = MessagePayload {
            message_id: "m2".into(),
            ..Default::default()
        };
        match buffer.try_buffer(&key, &text, "ch-1", false, None, false) {
            BufferOutcome::PassthroughWithFlush(group) => {
                assert_eq!(group.payload.message_id, "m1");
            },
            other => panic!("expected flush, got {other:?}"),
        }

        // No group left behind.
        match buffer.try_buffer(&key, &text, "ch-1", false, None, false) {
            BufferOutcome::Passthrough => {},
            other => panic!("expected passthrough, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unsafe_extra_url_is_skipped() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let buffer = MediaGroupBuffer::new(server(), tx);
        let key = group_key("ch-1", "u1");

        buffer.try_buffer(
            &key,
            &image_payload("m1", "/img/1.jpg"),
            "ch-1",
            false,
            Some("/img/1.jpg"),
            true,
        );
        buffer.try_buffer(
            &key,
            &image_payload("m2", "x"),
            "ch-1",
            false,
            Some("https://evil.example.com/x.jpg"),
            true,
        );

        let groups = buffer.dispose();
        assert_eq!(groups.len(), 1);
        assert!(groups[0].extras.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_flushes_every_pending_group_exactly_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let buffer = MediaGroupBuffer::new(server(), tx);

        for sender in ["u1", "u2"] {
            buffer.try_buffer(
                &group_key("ch-1", sender),
                &image_payload("m", "/i.jpg"),
                "ch-1",
                false,
                Some("/i.jpg"),
                true,
            );
        }

        let groups = buffer.dispose();
        assert_eq!(groups.len(), 2);
        assert!(buffer.dispose().is_empty());

        // Aborted timers must not deliver flushes that resolve to groups.
        tokio::time::sleep(Duration::from_secs(2)).await;
        while let Ok(due) = rx.try_recv() {
            assert!(buffer.take_due(&due).is_none());
        }
    }
}
