use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use futures_util::StreamExt;
use log::{debug, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::demux::StreamDemuxer;
use crate::message::{Attachment, Message, Role};
use crate::source::{PromptPayload, TokenSource};
use crate::store::ChatStore;

/// Default minimum delay between live-answer publishes.
pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_millis(120);

/// Coordinates generations for one conversation: owns the epoch counter,
/// the cancellable producer task, and the throttled publisher that feeds
/// the store's live-answer slot.
///
/// At most one epoch is live at a time. Every task captures its epoch at
/// spawn and re-checks it against the counter before each write, so work
/// belonging to a superseded generation silently drops out even if its
/// cancellation is slow to propagate.
pub struct ChatSession {
    store: Arc<ChatStore>,
    source: Arc<dyn TokenSource>,
    epoch: Arc<AtomicU64>,
    // Serializes epoch bumps against epoch-checked store writes, so a
    // finalization racing a new `send` cannot write under a stale check
    commit_lock: Arc<Mutex<()>>,
    publish_interval: Duration,
    current: Option<Generation>,
}

struct Generation {
    job: JoinHandle<()>,
    cancel: CancellationToken,
}

impl ChatSession {
    pub fn new(store: Arc<ChatStore>, source: Arc<dyn TokenSource>) -> Self {
        Self {
            store,
            source,
            epoch: Arc::new(AtomicU64::new(0)),
            commit_lock: Arc::new(Mutex::new(())),
            publish_interval: DEFAULT_PUBLISH_INTERVAL,
            current: None,
        }
    }

    pub fn with_publish_interval(mut self, interval: Duration) -> Self {
        self.publish_interval = interval;
        self
    }

    pub fn store(&self) -> Arc<ChatStore> {
        Arc::clone(&self.store)
    }

    /// Append the user's message (taking any pending attachments with it)
    /// and kick off a generation. Blank input is ignored.
    pub fn send(&mut self, text: &str) {
        if text.trim().is_empty() {
            return;
        }

        let attachments = self.store.take_attachments();
        self.store
            .push_message(Message::with_attachments(Role::User, text, attachments));

        let payload = PromptPayload::new(text);
        if let Ok(json) = serde_json::to_string(&payload) {
            debug!("payload size: {}", json.len());
        }

        self.start(payload);
    }

    /// Cancel the running generation, if any. The producer's finalization
    /// path commits whatever was streamed so far; nothing is lost.
    pub fn stop(&self) {
        if let Some(generation) = &self.current {
            generation.cancel.cancel();
        }
        let source = Arc::clone(&self.source);
        tokio::spawn(async move {
            source.abort().await;
        });
    }

    pub fn attach(&self, attachment: Attachment) {
        self.store.push_attachment(attachment);
    }

    pub fn clear_attachment(&self, idx: usize) {
        self.store.remove_attachment(idx);
    }

    /// Wait for the current generation (including its finalization) to
    /// complete. Generations superseded by a newer `send` finish on their
    /// own in the background.
    pub async fn join(&mut self) {
        if let Some(generation) = self.current.take() {
            let _ = generation.job.await;
        }
    }

    fn start(&mut self, payload: PromptPayload) {
        let guard = lock(&self.commit_lock);

        // Invalidate the previous generation before anything else: bump the
        // epoch so its in-flight callbacks become no-ops, then cancel it.
        let my_epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = self.current.take() {
            previous.cancel.cancel();
        }

        // Clear the live slot on behalf of the generation just superseded;
        // its own finalization sees a stale epoch and must not touch it.
        self.store.set_live_answer(String::new());
        self.store.set_generating(true);

        // Reserve the assistant slot. The index stays valid for the whole
        // generation because history is append-only below it.
        let reserved_idx = self.store.message_count();
        self.store.push_message(Message::new(Role::Assistant, ""));
        drop(guard);

        let cancel = CancellationToken::new();
        let ctx = GenerationCtx {
            store: Arc::clone(&self.store),
            source: Arc::clone(&self.source),
            epoch: Arc::clone(&self.epoch),
            commit_lock: Arc::clone(&self.commit_lock),
            my_epoch,
            reserved_idx,
            payload,
            cancel: cancel.clone(),
            publish_interval: self.publish_interval,
        };

        let job = tokio::spawn(run_generation(ctx));
        self.current = Some(Generation { job, cancel });
    }
}

struct GenerationCtx {
    store: Arc<ChatStore>,
    source: Arc<dyn TokenSource>,
    epoch: Arc<AtomicU64>,
    commit_lock: Arc<Mutex<()>>,
    my_epoch: u64,
    reserved_idx: usize,
    payload: PromptPayload,
    cancel: CancellationToken,
    publish_interval: Duration,
}

impl GenerationCtx {
    fn is_current(&self) -> bool {
        self.epoch.load(Ordering::SeqCst) == self.my_epoch
    }
}

/// One generation end to end: pump chunks through the demuxer, publish
/// throttled render views, then finalize exactly once whether the stream
/// completed, failed, or was cancelled.
async fn run_generation(ctx: GenerationCtx) {
    let mut demux = StreamDemuxer::new();

    // watch keeps only the latest view, which is exactly the conflation we
    // want between the producer and the publisher tick.
    let (view_tx, view_rx) = watch::channel(String::new());

    let publisher = tokio::spawn(publish_loop(
        view_rx,
        Arc::clone(&ctx.store),
        Arc::clone(&ctx.epoch),
        Arc::clone(&ctx.commit_lock),
        ctx.my_epoch,
        ctx.publish_interval,
    ));

    if let Err(e) = pump_chunks(&ctx, &mut demux, &view_tx).await {
        // Partial output beats an error bubble here; the buffered text is
        // still committed below.
        warn!("token source failed, keeping partial output: {e:#}");
    }

    // Finalization: flush the demuxer, stop the publisher before touching
    // history so no live-answer write can land after the commit.
    let final_view = demux.finalize();
    drop(view_tx);
    let _ = publisher.await;

    // The lock keeps the epoch check and the writes atomic against a
    // concurrent `start` bumping the counter mid-commit
    let _guard = lock(&ctx.commit_lock);
    if ctx.is_current() {
        ctx.store.replace_content(ctx.reserved_idx, final_view);
        ctx.store.set_live_answer(String::new());
        ctx.store.set_generating(false);
    } else {
        debug!("epoch {} superseded, commit skipped", ctx.my_epoch);
    }
}

async fn pump_chunks(
    ctx: &GenerationCtx,
    demux: &mut StreamDemuxer,
    view_tx: &watch::Sender<String>,
) -> Result<()> {
    let mut chunks = tokio::select! {
        _ = ctx.cancel.cancelled() => return Ok(()),
        opened = ctx.source.stream(&ctx.payload) => opened?,
    };

    loop {
        let next = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            next = chunks.next() => next,
        };

        let Some(chunk) = next else { break };
        let chunk = chunk?;
        if chunk.is_empty() {
            continue;
        }

        // Second safety net besides the cancellation token: drop stale work
        if !ctx.is_current() {
            break;
        }

        let view = demux.feed(&chunk);
        view_tx.send_replace(view);
    }

    Ok(())
}

/// Throttled UI writer: wake on a new view, let further chunks coalesce
/// for one tick, then publish the latest state. Exits once the producer
/// drops its sender.
async fn publish_loop(
    mut views: watch::Receiver<String>,
    store: Arc<ChatStore>,
    epoch: Arc<AtomicU64>,
    commit_lock: Arc<Mutex<()>>,
    my_epoch: u64,
    interval: Duration,
) {
    while views.changed().await.is_ok() {
        tokio::time::sleep(interval).await;
        let view = views.borrow_and_update().clone();
        let _guard = lock(&commit_lock);
        if epoch.load(Ordering::SeqCst) != my_epoch {
            continue;
        }
        store.set_live_answer(view);
    }
}

fn lock(mutex: &Mutex<()>) -> std::sync::MutexGuard<'_, ()> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
