// src/queue/mod.rs - Ordered command buffer with ack-paced release
use tokio::sync::mpsc;

/// Options accepted by [`CommandQueue::play`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PlayOptions {
    /// Restart from the first item when the end is reached.
    pub looping: bool,
}

/// An ordered buffer of command payloads with play/pause/stop/replay
/// semantics and a single "release one item" operation.
///
/// Execution is pull-based: each `release` hands out exactly one item,
/// which is what lets a caller gate throughput on controller
/// acknowledgments instead of writing unbounded data at the device.
/// Pure state machine; the only side effect is subscriber delivery.
#[derive(Debug, Default)]
pub struct CommandQueue {
    items: Vec<String>,
    cursor: usize,
    running: bool,
    looping: bool,
    subscribers: Vec<mpsc::UnboundedSender<String>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber; every released payload is delivered to all
    /// live subscribers in release order. Subscribers whose receiver is
    /// gone are pruned on the next release.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Appends payloads; never truncates, and leaves `running` and the
    /// cursor untouched.
    pub fn push<I>(&mut self, items: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.items.extend(items);
    }

    /// Starts (or resumes) playback and immediately attempts one release.
    pub fn play(&mut self, options: PlayOptions) {
        self.running = true;
        self.looping = options.looping;
        self.release();
    }

    /// Halts future releases; cursor and items are preserved, so a later
    /// `play` resumes where it left off.
    pub fn pause(&mut self) {
        self.running = false;
    }

    /// Halts playback and rewinds to the first item. Not resumable: a
    /// re-`play` starts over from item 0.
    pub fn stop(&mut self) {
        self.running = false;
        self.looping = false;
        self.cursor = 0;
    }

    pub fn replay(&mut self, options: PlayOptions) {
        self.stop();
        self.play(options);
    }

    /// Empties the buffer and rewinds the cursor without touching
    /// `running`.
    pub fn clear(&mut self) {
        self.items.clear();
        self.cursor = 0;
    }

    /// Releases the next item to every subscriber, advancing the cursor.
    /// No-op while paused or when the end is reached without looping;
    /// with looping enabled the wrap-around is transparent to the caller.
    pub fn release(&mut self) {
        if !self.running {
            return;
        }
        if self.looping && self.cursor > 0 && self.cursor >= self.items.len() {
            self.cursor = 0;
            return self.release();
        }
        if self.cursor < self.items.len() {
            let item = self.items[self.cursor].clone();
            self.cursor += 1;
            self.subscribers.retain(|tx| tx.send(item.clone()).is_ok());
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn size(&self) -> usize {
        self.items.len()
    }

    pub fn executed_count(&self) -> usize {
        self.cursor
    }
}
