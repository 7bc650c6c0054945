//! Polling capture adapter for an external terminal multiplexer.
//!
//! tmux is not push-based, so the adapter samples the active pane's
//! visible content and cursor on a fixed interval and synthesizes a
//! bus event whenever the sample differs from the previous one. It is
//! diff-by-presence: each event carries the full current screen state,
//! not an incremental patch. The poll loop only runs while at least
//! one consumer holds interest.

use std::process::Output;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::json;
use tokio::process::Command;

use crate::bus::{BusEvent, EventBus, EventFilter, EventSource, Subscriber};
use crate::error::{GatewayError, GatewayResult};

/// One observation of a pane: full visible content plus cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneSample {
    pub content: String,
    pub cursor_x: u32,
    pub cursor_y: u32,
}

/// The external multiplexer boundary: sample a pane, inject input,
/// resize the virtual terminal.
#[async_trait]
pub trait PaneSampler: Send + Sync {
    async fn sample(&self, target: &str) -> GatewayResult<PaneSample>;
    async fn send_input(&self, target: &str, data: &str, literal: bool) -> GatewayResult<()>;
    async fn resize(&self, target: &str, cols: u32, rows: u32) -> GatewayResult<()>;
}

/// `PaneSampler` backed by the tmux CLI, queried by session name.
pub struct TmuxSampler;

impl TmuxSampler {
    async fn run(&self, args: &[&str]) -> GatewayResult<String> {
        let output: Output = Command::new("tmux")
            .args(args)
            .output()
            .await
            .map_err(|e| GatewayError::CaptureUnavailable(format!("spawning tmux: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GatewayError::CaptureUnavailable(
                stderr.trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl PaneSampler for TmuxSampler {
    async fn sample(&self, target: &str) -> GatewayResult<PaneSample> {
        let content = self.run(&["capture-pane", "-p", "-t", target]).await?;
        let cursor = self
            .run(&["display-message", "-p", "-t", target, "#{cursor_x} #{cursor_y}"])
            .await?;

        let mut parts = cursor.split_whitespace();
        let cursor_x = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        let cursor_y = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        Ok(PaneSample {
            content,
            cursor_x,
            cursor_y,
        })
    }

    async fn send_input(&self, target: &str, data: &str, literal: bool) -> GatewayResult<()> {
        if literal {
            self.run(&["send-keys", "-t", target, "-l", data]).await?;
        } else {
            self.run(&["send-keys", "-t", target, data]).await?;
        }
        Ok(())
    }

    async fn resize(&self, target: &str, cols: u32, rows: u32) -> GatewayResult<()> {
        let cols = cols.to_string();
        let rows = rows.to_string();
        self.run(&["resize-window", "-t", target, "-x", &cols, "-y", &rows])
            .await?;
        Ok(())
    }
}

/// Polls the multiplexer while consumers are interested and feeds
/// changed samples into the bus as `capture` events.
pub struct CaptureService {
    bus: Arc<EventBus>,
    sampler: Arc<dyn PaneSampler>,
    interval: Duration,
    clients: AtomicUsize,
    /// Bumped every time a poll loop is spawned; a loop exits as soon
    /// as its generation is stale, so interest flapping within one
    /// interval never leaves two loops running.
    generation: AtomicU64,
    target: Mutex<String>,
    last: Mutex<Option<PaneSample>>,
}

impl CaptureService {
    pub fn new(
        bus: Arc<EventBus>,
        sampler: Arc<dyn PaneSampler>,
        interval: Duration,
        initial_target: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            sampler,
            interval,
            clients: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            target: Mutex::new(initial_target.into()),
            last: Mutex::new(None),
        }
    }

    /// Register consumer interest. The first client starts the poll
    /// loop; it stops once the last client leaves.
    pub fn add_client(self: Arc<Self>) {
        if self.clients.fetch_add(1, Ordering::SeqCst) == 0 {
            // A predecessor loop may still be waiting on its next tick;
            // advancing the generation retires it.
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            info!("capture interest acquired, starting poll loop");
            tokio::spawn(self.poll_loop(generation));
        }
    }

    pub fn remove_client(&self) {
        let prev = self.clients.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            info!("capture interest released, poll loop will stop");
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    /// Switch the active capture target. Takes effect on the next tick
    /// without restarting the loop; the next sample always emits.
    pub fn set_target(&self, target: impl Into<String>) {
        let target = target.into();
        info!("capture target switched to {}", target);
        *self.target.lock().unwrap() = target;
        *self.last.lock().unwrap() = None;
    }

    pub fn target(&self) -> String {
        self.target.lock().unwrap().clone()
    }

    /// Current screen state plus a live subscription, taken atomically
    /// so the consumer sees no gap between the initial frame and the
    /// first change event.
    pub fn attach(&self) -> (Option<BusEvent>, Subscriber) {
        let target = self.target();
        let last = self.last.lock().unwrap();
        let initial = last
            .as_ref()
            .map(|sample| self.sample_event(&target, sample));
        let subscriber = self.bus.subscribe(EventFilter {
            event_type: Some("capture".to_string()),
            ..Default::default()
        });
        drop(last);
        (initial, subscriber)
    }

    /// Inject input into the active target.
    pub async fn send_input(&self, data: &str, literal: bool) -> GatewayResult<()> {
        let target = self.target();
        self.sampler.send_input(&target, data, literal).await
    }

    /// Resize the active target's virtual terminal.
    pub async fn resize(&self, cols: u32, rows: u32) -> GatewayResult<()> {
        let target = self.target();
        self.sampler.resize(&target, cols, rows).await
    }

    async fn poll_loop(self: Arc<Self>, generation: u64) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            if self.generation.load(Ordering::SeqCst) != generation
                || self.clients.load(Ordering::SeqCst) == 0
            {
                debug!("capture poll loop stopped");
                return;
            }
            if let Err(err) = self.poll_once().await {
                debug!("capture poll failed: {}", err);
            }
        }
    }

    /// Sample the active target once; publish only when the sample
    /// differs from the previous one. Returns whether an event was
    /// emitted.
    pub async fn poll_once(&self) -> GatewayResult<bool> {
        let target = self.target();
        let sample = self.sampler.sample(&target).await?;

        let mut last = self.last.lock().unwrap();
        if last.as_ref() == Some(&sample) {
            return Ok(false);
        }
        let event = self.sample_event(&target, &sample);
        *last = Some(sample);
        // Published under the lock so attach cannot interleave.
        self.bus.publish(event);
        Ok(true)
    }

    fn sample_event(&self, target: &str, sample: &PaneSample) -> BusEvent {
        self.bus.make_event(
            EventSource::System,
            "capture",
            json!({
                "stream": target,
                "content": sample.content,
                "cursor": { "x": sample.cursor_x, "y": sample.cursor_y },
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct FakeSampler {
        samples: Mutex<VecDeque<GatewayResult<PaneSample>>>,
        inputs: Mutex<Vec<(String, String, bool)>>,
        resizes: Mutex<Vec<(String, u32, u32)>>,
    }

    impl FakeSampler {
        fn new(samples: Vec<GatewayResult<PaneSample>>) -> Arc<Self> {
            Arc::new(Self {
                samples: Mutex::new(samples.into()),
                inputs: Mutex::new(Vec::new()),
                resizes: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PaneSampler for FakeSampler {
        async fn sample(&self, _target: &str) -> GatewayResult<PaneSample> {
            self.samples
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(GatewayError::CaptureUnavailable("exhausted".into())))
        }

        async fn send_input(&self, target: &str, data: &str, literal: bool) -> GatewayResult<()> {
            self.inputs
                .lock()
                .unwrap()
                .push((target.to_string(), data.to_string(), literal));
            Ok(())
        }

        async fn resize(&self, target: &str, cols: u32, rows: u32) -> GatewayResult<()> {
            self.resizes.lock().unwrap().push((target.to_string(), cols, rows));
            Ok(())
        }
    }

    fn sample(content: &str, x: u32, y: u32) -> PaneSample {
        PaneSample {
            content: content.to_string(),
            cursor_x: x,
            cursor_y: y,
        }
    }

    fn service(sampler: Arc<FakeSampler>) -> (Arc<CaptureService>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let service = Arc::new(CaptureService::new(
            Arc::clone(&bus),
            sampler,
            Duration::from_millis(5),
            "main",
        ));
        (service, bus)
    }

    #[tokio::test]
    async fn test_unchanged_sample_emits_nothing() {
        let sampler = FakeSampler::new(vec![
            Ok(sample("screen", 0, 0)),
            Ok(sample("screen", 0, 0)),
        ]);
        let (service, _bus) = service(sampler);

        assert!(service.poll_once().await.unwrap());
        assert!(!service.poll_once().await.unwrap());
    }

    #[tokio::test]
    async fn test_cursor_move_alone_counts_as_change() {
        let sampler = FakeSampler::new(vec![
            Ok(sample("screen", 0, 0)),
            Ok(sample("screen", 3, 1)),
        ]);
        let (service, _bus) = service(sampler);
        let (_, mut sub) = service.attach();

        service.poll_once().await.unwrap();
        assert!(service.poll_once().await.unwrap());

        let first = sub.try_recv().unwrap();
        let second = sub.try_recv().unwrap();
        assert_eq!(first.payload["cursor"]["x"], 0);
        assert_eq!(second.payload["cursor"]["x"], 3);
        // Full screen state every time, not a patch.
        assert_eq!(second.payload["content"], "screen");
    }

    #[tokio::test]
    async fn test_attach_after_first_sample_gets_initial_frame() {
        let sampler = FakeSampler::new(vec![Ok(sample("hello", 1, 2))]);
        let (service, _bus) = service(sampler);

        service.poll_once().await.unwrap();
        let (initial, _sub) = service.attach();

        let initial = initial.unwrap();
        assert_eq!(initial.event_type, "capture");
        assert_eq!(initial.payload["content"], "hello");
        assert_eq!(initial.payload["cursor"]["y"], 2);
    }

    #[tokio::test]
    async fn test_target_switch_is_immediate_and_forces_emit() {
        let sampler = FakeSampler::new(vec![
            Ok(sample("same", 0, 0)),
            Ok(sample("same", 0, 0)),
        ]);
        let (service, _bus) = service(Arc::clone(&sampler));

        assert!(service.poll_once().await.unwrap());
        service.set_target("other");
        assert_eq!(service.target(), "other");
        // Identical content still emits after a switch: last sample
        // was cleared.
        assert!(service.poll_once().await.unwrap());
    }

    #[tokio::test]
    async fn test_capture_unavailable_propagates() {
        let sampler = FakeSampler::new(vec![Err(GatewayError::CaptureUnavailable(
            "no server running".into(),
        ))]);
        let (service, _bus) = service(sampler);

        let outcome = service.poll_once().await;
        assert!(matches!(outcome, Err(GatewayError::CaptureUnavailable(_))));
    }

    #[tokio::test]
    async fn test_input_and_resize_reach_the_active_target() {
        let sampler = FakeSampler::new(vec![]);
        let (service, _bus) = service(Arc::clone(&sampler));
        service.set_target("work");

        service.send_input("ls\n", true).await.unwrap();
        service.resize(120, 40).await.unwrap();

        assert_eq!(
            sampler.inputs.lock().unwrap().as_slice(),
            &[("work".to_string(), "ls\n".to_string(), true)]
        );
        assert_eq!(
            sampler.resizes.lock().unwrap().as_slice(),
            &[("work".to_string(), 120, 40)]
        );
    }

    /// Counts sampler invocations; every sample differs so each tick
    /// emits.
    struct CountingSampler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PaneSampler for CountingSampler {
        async fn sample(&self, _target: &str) -> GatewayResult<PaneSample> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(sample(&format!("frame-{n}"), 0, 0))
        }

        async fn send_input(&self, _target: &str, _data: &str, _literal: bool) -> GatewayResult<()> {
            Ok(())
        }

        async fn resize(&self, _target: &str, _cols: u32, _rows: u32) -> GatewayResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_interest_flapping_never_stacks_poll_loops() {
        let sampler = Arc::new(CountingSampler {
            calls: AtomicUsize::new(0),
        });
        let bus = Arc::new(EventBus::new());
        let interval = Duration::from_millis(20);
        let service = Arc::new(CaptureService::new(
            Arc::clone(&bus),
            Arc::clone(&sampler) as Arc<dyn PaneSampler>,
            interval,
            "main",
        ));

        // Drop to zero and re-acquire before the first loop can
        // observe the zero at a tick.
        Arc::clone(&service).add_client();
        service.remove_client();
        Arc::clone(&service).add_client();
        assert_eq!(service.client_count(), 1);

        tokio::time::sleep(interval * 25).await;
        let calls = sampler.calls.load(Ordering::SeqCst);

        // One loop samples roughly once per interval; a leaked second
        // loop would double the rate.
        assert!(calls >= 5, "poll loop never ran ({calls} samples)");
        assert!(calls <= 35, "duplicate poll loops running ({calls} samples)");
    }

    #[tokio::test]
    async fn test_interest_refcount_starts_and_stops_loop() {
        // Every sample differs so each tick emits.
        let samples: Vec<GatewayResult<PaneSample>> =
            (0..1000).map(|i| Ok(sample(&format!("frame-{i}"), 0, 0))).collect();
        let sampler = FakeSampler::new(samples);
        let (service, _bus) = service(sampler);
        let (_, mut sub) = service.attach();

        Arc::clone(&service).add_client();
        assert_eq!(service.client_count(), 1);

        let first = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("poll loop should emit")
            .unwrap();
        assert_eq!(first.event_type, "capture");

        service.remove_client();
        assert_eq!(service.client_count(), 0);

        // Let the loop observe zero interest and exit, then verify the
        // event flow stops.
        tokio::time::sleep(Duration::from_millis(50)).await;
        while sub.try_recv().is_some() {}
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sub.try_recv().is_none());
    }
}
