use std::sync::{Mutex, Once};

use crossbeam_channel::{bounded, Receiver, Sender};

/// A broadcast-once shutdown signal: a channel whose sender is dropped
/// exactly once. Every waiter holds a cloned [`Receiver`] and selects on it
/// — closing the channel wakes every one of them, mirroring a Go `chan`
/// closed exactly once.
#[derive(Debug)]
pub struct Down {
    once: Once,
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

impl Down {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Down {
            once: Once::new(),
            sender: Mutex::new(Some(tx)),
            receiver: rx,
        }
    }

    /// Fires the signal. Returns whether this call was the one that fired it
    /// (`set_once` in the reference implementation).
    pub fn fire(&self) -> bool {
        let mut fired = false;
        self.once.call_once(|| {
            self.sender.lock().unwrap().take();
            fired = true;
        });
        fired
    }

    /// A cloned handle suitable for `crossbeam_channel::select!`.
    pub fn receiver(&self) -> Receiver<()> {
        self.receiver.clone()
    }

    /// Non-blocking check of whether the signal has fired (`ready(ch)` in
    /// the reference implementation).
    pub fn is_fired(&self) -> bool {
        matches!(
            self.receiver.try_recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected)
        )
    }
}

impl Default for Down {
    fn default() -> Self {
        Down::new()
    }
}
