//! Bounded per-stream replay buffers.
//!
//! Each terminal run (or capture target) gets a buffer holding the most
//! recent raw output up to a fixed byte ceiling, so a subscriber that
//! attaches late can replay history before receiving live chunks. The
//! snapshot taken at attach time is atomic with respect to subscription
//! registration: no chunk is both missing from the snapshot and missing
//! from the live feed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info};
use serde_json::json;

use crate::bus::{EventBus, EventFilter, EventSource, Subscriber};

/// Default byte ceiling per stream.
pub const DEFAULT_BYTE_CEILING: usize = 64 * 1024;

/// Identity metadata stamped onto the events a stream emits.
#[derive(Debug, Clone, Default)]
pub struct StreamMeta {
    pub label: Option<String>,
    pub project_id: Option<String>,
    pub session_id: Option<String>,
}

struct StreamBuffer {
    data: VecDeque<u8>,
    closed: bool,
    last_touch: Instant,
}

impl StreamBuffer {
    fn new() -> Self {
        Self {
            data: VecDeque::new(),
            closed: false,
            last_touch: Instant::now(),
        }
    }

    fn push(&mut self, chunk: &[u8], ceiling: usize) {
        self.data.extend(chunk.iter().copied());
        if self.data.len() > ceiling {
            let excess = self.data.len() - ceiling;
            self.data.drain(..excess);
        }
        self.last_touch = Instant::now();
    }

    fn contents(&self) -> Vec<u8> {
        self.data.iter().copied().collect()
    }
}

/// Registry of replay buffers keyed by stream identity.
pub struct ReplayRegistry {
    bus: Arc<EventBus>,
    streams: DashMap<String, Arc<Mutex<StreamBuffer>>>,
    ceiling: usize,
}

impl ReplayRegistry {
    pub fn new(bus: Arc<EventBus>, ceiling: usize) -> Self {
        Self {
            bus,
            streams: DashMap::new(),
            ceiling,
        }
    }

    fn entry(&self, stream_key: &str) -> Arc<Mutex<StreamBuffer>> {
        self.streams
            .entry(stream_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(StreamBuffer::new())))
            .clone()
    }

    /// Append raw bytes to a stream and publish the chunk as a `pty`
    /// event. A buffer is created on first output for its key; a key
    /// reused after `close` starts a fresh buffer.
    pub fn append(&self, stream_key: &str, chunk: &[u8], meta: &StreamMeta) {
        let entry = self.entry(stream_key);
        let mut buffer = entry.lock().unwrap();
        if buffer.closed {
            debug!("stream {} reused after close, starting fresh", stream_key);
            *buffer = StreamBuffer::new();
        }
        buffer.push(chunk, self.ceiling);

        let mut event = self.bus.make_event(
            EventSource::Gateway,
            "pty",
            json!({
                "stream": stream_key,
                "data": BASE64.encode(chunk),
                "label": meta.label,
            }),
        );
        event.project_id = meta.project_id.clone();
        event.session_id = meta.session_id.clone();
        // Published under the stream lock so attach cannot interleave.
        self.bus.publish(event);
    }

    /// Currently retained history for a stream, if it has one.
    pub fn snapshot(&self, stream_key: &str) -> Option<Vec<u8>> {
        let entry = self.streams.get(stream_key)?;
        let buffer = entry.lock().unwrap();
        Some(buffer.contents())
    }

    /// Atomically snapshot a stream and register a live subscription
    /// for its subsequent chunks.
    ///
    /// The replayed bytes always precede newly arriving bytes in the
    /// caller's observed sequence: appends hold the same lock, so every
    /// chunk lands either in the snapshot or in the live feed, never in
    /// neither and never in both. Attaching to a key with no buffer
    /// yields an empty snapshot without allocating one; buffers exist
    /// only once their stream produces output.
    pub fn attach(&self, stream_key: &str) -> (Vec<u8>, Subscriber) {
        // The entry guard keeps the map slot locked across subscribe,
        // so a first append racing in cannot publish a chunk we would
        // miss.
        match self.streams.entry(stream_key.to_string()) {
            Entry::Occupied(slot) => {
                let buffer = slot.get().lock().unwrap();
                let snapshot = buffer.contents();
                let subscriber = self.bus.subscribe(EventFilter::for_stream(stream_key));
                (snapshot, subscriber)
            }
            Entry::Vacant(_slot) => {
                let subscriber = self.bus.subscribe(EventFilter::for_stream(stream_key));
                (Vec::new(), subscriber)
            }
        }
    }

    /// Mark a stream ended, publish its terminal lifecycle event, and
    /// leave the buffer for the sweeper to dispose of.
    pub fn close(&self, stream_key: &str, meta: &StreamMeta) {
        let Some(entry) = self.streams.get(stream_key) else {
            return;
        };
        {
            let mut buffer = entry.lock().unwrap();
            buffer.closed = true;
            buffer.last_touch = Instant::now();
        }
        info!("stream {} closed", stream_key);

        let mut event = self.bus.make_event(
            EventSource::Gateway,
            "pty",
            json!({
                "stream": stream_key,
                "closed": true,
            }),
        );
        event.project_id = meta.project_id.clone();
        event.session_id = meta.session_id.clone();
        self.bus.publish(event);
    }

    /// Dispose of buffers whose streams ended (after a grace period so
    /// late attachers can still replay) and buffers idle past the
    /// eviction window.
    pub fn sweep(&self, idle_window: Duration, close_grace: Duration) {
        self.streams.retain(|key, entry| {
            let buffer = entry.lock().unwrap();
            let age = buffer.last_touch.elapsed();
            let keep = if buffer.closed {
                age < close_grace
            } else {
                age < idle_window
            };
            if !keep {
                debug!("disposing replay buffer for stream {}", key);
            }
            keep
        });
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(ceiling: usize) -> ReplayRegistry {
        ReplayRegistry::new(Arc::new(EventBus::new()), ceiling)
    }

    fn decode_chunk(event: &crate::bus::BusEvent) -> Vec<u8> {
        let data = event.payload["data"].as_str().unwrap();
        BASE64.decode(data).unwrap()
    }

    #[test]
    fn test_buffer_never_exceeds_ceiling_and_evicts_oldest() {
        let registry = registry(16);
        let meta = StreamMeta::default();

        let injected: Vec<u8> = (0u8..64).collect();
        for chunk in injected.chunks(5) {
            registry.append("run-1", chunk, &meta);
        }

        let snapshot = registry.snapshot("run-1").unwrap();
        assert_eq!(snapshot.len(), 16);
        // Exactly the suffix of the injected stream survives.
        assert_eq!(snapshot, injected[injected.len() - 16..]);
    }

    #[test]
    fn test_snapshot_then_live_concatenation_equals_full_stream() {
        let registry = registry(1024);
        let meta = StreamMeta::default();

        registry.append("run-1", b"early ", &meta);
        registry.append("run-1", b"output ", &meta);

        let (snapshot, mut sub) = registry.attach("run-1");

        registry.append("run-1", b"late ", &meta);
        registry.append("run-1", b"bytes", &meta);

        let mut observed = snapshot;
        while let Some(event) = sub.try_recv() {
            observed.extend(decode_chunk(&event));
        }
        assert_eq!(observed, b"early output late bytes");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_attach_during_concurrent_appends_has_no_gap_or_duplicate() {
        let registry = Arc::new(registry(1 << 20));
        let chunks: Vec<Vec<u8>> = (0..200u32)
            .map(|i| format!("chunk-{i};").into_bytes())
            .collect();
        let full: Vec<u8> = chunks.iter().flatten().copied().collect();

        let writer = {
            let registry = Arc::clone(&registry);
            let chunks = chunks.clone();
            tokio::task::spawn_blocking(move || {
                let meta = StreamMeta::default();
                for chunk in &chunks {
                    registry.append("run-x", chunk, &meta);
                }
            })
        };

        // Attach somewhere in the middle of the write burst.
        tokio::time::sleep(Duration::from_millis(1)).await;
        let (snapshot, mut sub) = registry.attach("run-x");

        writer.await.unwrap();

        let mut observed = snapshot;
        while let Some(event) = sub.try_recv() {
            observed.extend(decode_chunk(&event));
        }
        assert_eq!(observed, full);
    }

    #[test]
    fn test_close_publishes_lifecycle_event_and_sweep_disposes() {
        let bus = Arc::new(EventBus::new());
        let registry = ReplayRegistry::new(Arc::clone(&bus), 1024);
        let meta = StreamMeta::default();

        registry.append("run-1", b"data", &meta);
        let mut sub = bus.subscribe(EventFilter::for_stream("run-1"));
        registry.close("run-1", &meta);

        let event = sub.try_recv().unwrap();
        assert_eq!(event.payload["closed"].as_bool(), Some(true));

        // Still replayable inside the grace window.
        assert_eq!(registry.snapshot("run-1").unwrap(), b"data");
        registry.sweep(Duration::from_secs(3600), Duration::from_secs(3600));
        assert_eq!(registry.stream_count(), 1);

        // Grace elapsed: disposed.
        registry.sweep(Duration::from_secs(3600), Duration::ZERO);
        assert_eq!(registry.stream_count(), 0);
    }

    #[test]
    fn test_reused_key_after_close_starts_fresh_buffer() {
        let registry = registry(1024);
        let meta = StreamMeta::default();

        registry.append("run-1", b"old", &meta);
        registry.close("run-1", &meta);
        registry.append("run-1", b"new", &meta);

        assert_eq!(registry.snapshot("run-1").unwrap(), b"new");
    }

    #[test]
    fn test_attach_to_unknown_key_allocates_nothing() {
        let registry = registry(1024);

        let (snapshot, mut sub) = registry.attach("never-seen");
        assert!(snapshot.is_empty());
        assert_eq!(registry.stream_count(), 0);

        // First output creates the buffer and reaches the live feed.
        registry.append("never-seen", b"hi", &StreamMeta::default());
        assert_eq!(registry.stream_count(), 1);
        let event = sub.try_recv().unwrap();
        assert_eq!(decode_chunk(&event), b"hi");
    }

    #[test]
    fn test_idle_buffer_evicted() {
        let registry = registry(1024);
        registry.append("run-1", b"data", &StreamMeta::default());

        registry.sweep(Duration::ZERO, Duration::from_secs(3600));
        assert_eq!(registry.stream_count(), 0);
    }
}
