//! Paced outbound audio
//!
//! Synthesis hands the engine audio in bursts; the transport expects
//! fixed-size frames on a real-time cadence. The sender buffers pushed
//! bytes and emits one frame per tick against a drift-free virtual
//! clock, prebuffering a few frames to absorb producer jitter and
//! backing off while the transport reports backpressure.

use call_engine_core::{CallId, OutboundAudio};
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Pacing tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacerConfig {
    /// Bytes per outbound frame (160 = 20 ms of 8 kHz μ-law).
    pub frame_bytes: usize,
    /// Tick interval in milliseconds.
    pub frame_interval_ms: u64,
    /// Bytes that must be buffered before the first frame goes out,
    /// unless the producer has already finished.
    pub prebuffer_bytes: usize,
    /// Transport-buffered bytes above which sending pauses.
    pub backpressure_limit: usize,
    /// Backoff while the transport is backpressured.
    pub backpressure_delay_ms: u64,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            frame_bytes: 160,
            frame_interval_ms: 20,
            prebuffer_bytes: 1600,
            backpressure_limit: 64 * 1024,
            backpressure_delay_ms: 40,
        }
    }
}

/// Terminal outcome of one pacing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacerEvent {
    /// Producer finished and the buffer drained.
    Completed,
    /// `stop()` discarded the remaining buffer.
    Stopped,
    /// The transport rejected a frame; the sender shut itself down.
    TransportClosed,
}

#[derive(Default)]
struct PacerState {
    buffer: VecDeque<u8>,
    running: bool,
    finished: bool,
    /// Bumped on every run start. A task whose epoch is no longer
    /// current has been superseded by a restart and must exit without
    /// touching state or emitting an event.
    epoch: u64,
}

struct PacerShared {
    call: CallId,
    config: PacerConfig,
    transport: Arc<dyn OutboundAudio>,
    state: Mutex<PacerState>,
    wake: Notify,
    events: mpsc::UnboundedSender<PacerEvent>,
}

/// Paced frame sender for one call.
///
/// `push` appends bytes and lazily starts the pacing task; `stop` halts
/// it immediately and discards unsent bytes; `finish` marks the end of
/// producer input so the run can complete once drained. A terminal
/// [`PacerEvent`] is emitted per run.
pub struct PacedSender {
    inner: Arc<PacerShared>,
}

impl PacedSender {
    pub fn new(
        call: CallId,
        config: PacerConfig,
        transport: Arc<dyn OutboundAudio>,
    ) -> (Self, mpsc::UnboundedReceiver<PacerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PacerShared {
            call,
            config,
            transport,
            state: Mutex::new(PacerState::default()),
            wake: Notify::new(),
            events,
        });
        (Self { inner }, rx)
    }

    /// Append audio bytes, starting the pacing task if it is not
    /// already running.
    pub fn push(&self, bytes: &[u8]) {
        let start = {
            let mut st = self.inner.state.lock();
            st.buffer.extend(bytes.iter().copied());
            if st.running {
                None
            } else {
                st.running = true;
                st.finished = false;
                st.epoch += 1;
                Some(st.epoch)
            }
        };
        if let Some(epoch) = start {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(run(inner, epoch));
        }
        // Also rouses a superseded task still parked on its tick after
        // a stop-then-push restart, so it notices and bows out.
        self.inner.wake.notify_one();
    }

    /// Mark end of producer input; the run completes once drained.
    pub fn finish(&self) {
        let notify = {
            let mut st = self.inner.state.lock();
            if st.running {
                st.finished = true;
            }
            st.running
        };
        if notify {
            self.inner.wake.notify_one();
        }
    }

    /// Halt pacing immediately, discarding unsent bytes. Idempotent.
    pub fn stop(&self) {
        {
            let mut st = self.inner.state.lock();
            if !st.running && st.buffer.is_empty() {
                return;
            }
            st.running = false;
            st.finished = false;
            st.buffer.clear();
        }
        self.inner.wake.notify_one();
    }

    /// Whether a pacing run is active.
    pub fn is_active(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Unsent bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.inner.state.lock().buffer.len()
    }
}

enum Step {
    /// A full frame is buffered and eligible to send.
    Ready,
    /// Nothing to do yet; recheck after the delay or on wake.
    Idle(Duration),
    /// Terminal.
    Done(PacerEvent),
    /// A newer run owns the state; exit without an event.
    Orphaned,
}

async fn run(inner: Arc<PacerShared>, epoch: u64) {
    let cfg = inner.config.clone();
    let interval = Duration::from_millis(cfg.frame_interval_ms);
    let min_first_send = cfg.prebuffer_bytes.max(cfg.frame_bytes);
    let mut next_due: Option<Instant> = None;
    let mut frames_sent: u64 = 0;

    loop {
        let step = {
            let mut st = inner.state.lock();
            if st.epoch != epoch {
                Step::Orphaned
            } else if !st.running {
                Step::Done(PacerEvent::Stopped)
            } else if st.buffer.len() < cfg.frame_bytes {
                if st.finished {
                    st.running = false;
                    st.buffer.clear();
                    Step::Done(PacerEvent::Completed)
                } else {
                    Step::Idle(interval)
                }
            } else if next_due.is_none() && !st.finished && st.buffer.len() < min_first_send {
                // Still prebuffering: absorb producer jitter before the
                // first frame goes out.
                Step::Idle(interval)
            } else if inner.transport.buffered_bytes(&inner.call) > cfg.backpressure_limit {
                Step::Idle(Duration::from_millis(cfg.backpressure_delay_ms))
            } else {
                Step::Ready
            }
        };

        match step {
            Step::Done(event) => {
                debug!(call_id = %inner.call, frames_sent, ?event, "pacer run finished");
                let _ = inner.events.send(event);
                return;
            }
            Step::Orphaned => {
                debug!(call_id = %inner.call, frames_sent, "pacer run superseded by restart");
                return;
            }
            Step::Idle(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = inner.wake.notified() => {}
                }
            }
            Step::Ready => {
                if let Some(due) = next_due {
                    let woken = tokio::select! {
                        _ = tokio::time::sleep_until(due) => false,
                        _ = inner.wake.notified() => true,
                    };
                    if woken {
                        // State changed under us; re-evaluate before sending.
                        continue;
                    }
                }
                let frame: Vec<u8> = {
                    let mut st = inner.state.lock();
                    if st.epoch != epoch || !st.running || st.buffer.len() < cfg.frame_bytes {
                        continue;
                    }
                    st.buffer.drain(..cfg.frame_bytes).collect()
                };
                match inner.transport.send_frame(&inner.call, &frame).await {
                    Ok(()) => {
                        frames_sent += 1;
                        let now = Instant::now();
                        let due = match next_due {
                            Some(due) => (due + interval).max(now),
                            None => now + interval,
                        };
                        next_due = Some(due);
                    }
                    Err(err) => {
                        warn!(call_id = %inner.call, error = %err, "outbound send failed, stopping pacer");
                        counter!("call_engine_transport_send_failures_total").increment(1);
                        let current = {
                            let mut st = inner.state.lock();
                            if st.epoch == epoch {
                                st.running = false;
                                st.buffer.clear();
                                true
                            } else {
                                false
                            }
                        };
                        if current {
                            let _ = inner.events.send(PacerEvent::TransportClosed);
                        }
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use call_engine_core::{Error, Result};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct RecordingTransport {
        sent: Mutex<Vec<(Instant, Vec<u8>)>>,
        buffered: AtomicUsize,
        fail_sends: AtomicBool,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                buffered: AtomicUsize::new(0),
                fail_sends: AtomicBool::new(false),
            })
        }

        fn sent_bytes(&self) -> usize {
            self.sent.lock().iter().map(|(_, f)| f.len()).sum()
        }
    }

    #[async_trait]
    impl OutboundAudio for RecordingTransport {
        async fn send_frame(&self, _call: &CallId, frame: &[u8]) -> Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(Error::Transport("socket closed".into()));
            }
            self.sent.lock().push((Instant::now(), frame.to_vec()));
            Ok(())
        }

        async fn clear(&self, _call: &CallId) -> Result<()> {
            Ok(())
        }

        fn buffered_bytes(&self, _call: &CallId) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }
    }

    fn sender(transport: Arc<RecordingTransport>) -> (PacedSender, mpsc::UnboundedReceiver<PacerEvent>) {
        PacedSender::new(CallId::new("CA1"), PacerConfig::default(), transport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cadence_and_total_bytes() {
        let transport = RecordingTransport::new();
        let (sender, mut events) = sender(Arc::clone(&transport));

        sender.push(&vec![0u8; 160 * 20]);
        sender.finish();

        assert_eq!(events.recv().await, Some(PacerEvent::Completed));
        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 20);
        assert!(sent.iter().all(|(_, f)| f.len() == 160));
        // Drift-free clock: consecutive frames exactly one interval apart.
        for pair in sent.windows(2) {
            assert_eq!(pair[1].0 - pair[0].0, Duration::from_millis(20));
        }
        assert!(!sender.is_active());
        assert_eq!(sender.buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prebuffer_holds_first_frame() {
        let transport = RecordingTransport::new();
        let (sender, mut events) = sender(Arc::clone(&transport));

        // One frame buffered, producer still going: nothing may be sent.
        sender.push(&vec![0u8; 160]);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(transport.sent.lock().len(), 0);

        sender.push(&vec![0u8; 160 * 9]);
        sender.finish();
        assert_eq!(events.recv().await, Some(PacerEvent::Completed));
        assert_eq!(transport.sent.lock().len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_finished_payload_bypasses_prebuffer() {
        let transport = RecordingTransport::new();
        let (sender, mut events) = sender(Arc::clone(&transport));

        sender.push(&vec![0u8; 320]);
        sender.finish();
        assert_eq!(events.recv().await, Some(PacerEvent::Completed));
        assert_eq!(transport.sent.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_delays_without_losing_data() {
        let transport = RecordingTransport::new();
        transport.buffered.store(128 * 1024, Ordering::SeqCst);
        let (sender, mut events) = sender(Arc::clone(&transport));

        sender.push(&vec![0u8; 160 * 10]);
        sender.finish();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(transport.sent.lock().len(), 0, "no frames while backpressured");

        transport.buffered.store(0, Ordering::SeqCst);
        assert_eq!(events.recv().await, Some(PacerEvent::Completed));
        assert_eq!(transport.sent_bytes(), 160 * 10, "held bytes sent once pressure clears");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_remaining_buffer() {
        let transport = RecordingTransport::new();
        let (sender, mut events) = sender(Arc::clone(&transport));

        sender.push(&vec![0u8; 160 * 100]);
        tokio::time::sleep(Duration::from_millis(90)).await;
        sender.stop();
        sender.stop();

        assert_eq!(events.recv().await, Some(PacerEvent::Stopped));
        let sent = transport.sent.lock().len();
        assert!(sent < 100, "stop must cut the stream short, sent {sent}");
        assert_eq!(sender.buffered(), 0);
        assert!(!sender.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_stops_sender() {
        let transport = RecordingTransport::new();
        transport.fail_sends.store(true, Ordering::SeqCst);
        let (sender, mut events) = sender(Arc::clone(&transport));

        sender.push(&vec![0u8; 160 * 10]);
        sender.finish();

        assert_eq!(events.recv().await, Some(PacerEvent::TransportClosed));
        assert!(!sender.is_active());
        assert_eq!(sender.buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_after_completion_starts_new_run() {
        let transport = RecordingTransport::new();
        let (sender, mut events) = sender(Arc::clone(&transport));

        sender.push(&vec![0u8; 160 * 10]);
        sender.finish();
        assert_eq!(events.recv().await, Some(PacerEvent::Completed));

        sender.push(&vec![0u8; 160 * 10]);
        sender.finish();
        assert_eq!(events.recv().await, Some(PacerEvent::Completed));
        assert_eq!(transport.sent.lock().len(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_then_push_keeps_single_cadence() {
        let transport = RecordingTransport::new();
        let (sender, mut events) = sender(Arc::clone(&transport));

        sender.push(&vec![0u8; 160 * 20]);
        tokio::time::sleep(Duration::from_millis(90)).await;

        // Restart before the superseded run has observed the stop; only
        // the new run may keep pacing, on its own clock.
        sender.stop();
        sender.push(&vec![0u8; 160 * 40]);
        sender.finish();

        assert_eq!(events.recv().await, Some(PacerEvent::Completed));
        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 5 + 40, "old run sent 5 frames, new run 40");
        for pair in sent[5..].windows(2) {
            assert_eq!(pair[1].0 - pair[0].0, Duration::from_millis(20));
        }
    }
}
