use thiserror::Error;
use tokio::sync::watch;

/// The hop stopped before it became ready.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("hop stopped before becoming ready")]
pub struct NotReady;

/// Fires once. Consuming `fire` makes a second firing unrepresentable.
#[derive(Debug)]
pub struct ReadySignal {
    tx: watch::Sender<bool>,
}

/// Any number of observers of one [`ReadySignal`].
#[derive(Clone, Debug)]
pub struct ReadyWatch {
    rx: watch::Receiver<bool>,
}

pub fn ready_pair() -> (ReadySignal, ReadyWatch) {
    let (tx, rx) = watch::channel(false);
    (ReadySignal { tx }, ReadyWatch { rx })
}

impl ReadySignal {
    pub fn fire(self) {
        self.tx.send_replace(true);
    }
}

impl ReadyWatch {
    /// Resolves when the signal fired, or errors once it was dropped unfired.
    pub async fn wait(&mut self) -> Result<(), NotReady> {
        self.rx.wait_for(|ready| *ready).await.map(|_| ()).map_err(|_| NotReady)
    }

    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }
}
