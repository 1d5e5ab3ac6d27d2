//! Frame bus: the ordered, back-pressured conduit between pipeline stages
//!
//! Each bus connects exactly one producer stage to one consumer stage and is
//! parameterized by frame type. `send` suspends while the consumer has not
//! drained past the buffer bound; `try_send` surfaces `Overloaded` instead.
//! Once the producer side is closed and the buffer drained, `recv` fails
//! with `Closed`, which is how closure propagates downstream. A frame that
//! cannot be delivered before closure is handed back to the producer as
//! `Discarded` rather than dropped silently.

use tokio::sync::mpsc;

/// Create a bus with the given buffer bound.
pub fn bus<T>(capacity: usize) -> (FrameSender<T>, FrameReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (FrameSender { tx: Some(tx) }, FrameReceiver { rx })
}

/// Send-side failure: the bus closed before the frame could be delivered.
#[derive(Debug, PartialEq, Eq)]
pub struct SendError<T> {
    /// The undelivered frame, returned to the producer
    pub discarded: T,
}

impl<T> std::fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame discarded: bus closed before delivery")
    }
}

impl<T: std::fmt::Debug> std::error::Error for SendError<T> {}

/// Non-blocking send failure
#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// Buffer bound reached; consumer has not drained fast enough
    Overloaded(T),
    /// Bus closed before delivery
    Discarded(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Overloaded(frame) | TrySendError::Discarded(frame) => frame,
        }
    }
}

impl<T> std::fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrySendError::Overloaded(_) => write!(f, "bus overloaded: buffer bound reached"),
            TrySendError::Discarded(_) => write!(f, "frame discarded: bus closed"),
        }
    }
}

impl<T: std::fmt::Debug> std::error::Error for TrySendError<T> {}

/// Receive-side failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
    /// Producer closed and the buffer is drained
    #[error("bus closed and drained")]
    Closed,
}

/// Producer half of a frame bus.
///
/// The producing stage may clone its handle across its own tasks; `close`
/// acts per handle, and the bus closes once every handle is closed or
/// dropped.
pub struct FrameSender<T> {
    tx: Option<mpsc::Sender<T>>,
}

impl<T> Clone for FrameSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> FrameSender<T> {
    /// Deliver a frame, suspending while the buffer is full.
    pub async fn send(&self, frame: T) -> Result<(), SendError<T>> {
        match &self.tx {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|e| SendError { discarded: e.0 }),
            None => Err(SendError { discarded: frame }),
        }
    }

    /// Deliver a frame without suspending.
    pub fn try_send(&self, frame: T) -> Result<(), TrySendError<T>> {
        match &self.tx {
            Some(tx) => tx.try_send(frame).map_err(|e| match e {
                mpsc::error::TrySendError::Full(frame) => TrySendError::Overloaded(frame),
                mpsc::error::TrySendError::Closed(frame) => TrySendError::Discarded(frame),
            }),
            None => Err(TrySendError::Discarded(frame)),
        }
    }

    /// Close the producer side. Idempotent; the consumer keeps draining
    /// buffered frames and then observes `Closed`.
    pub fn close(&mut self) {
        self.tx = None;
    }

    pub fn is_closed(&self) -> bool {
        match &self.tx {
            Some(tx) => tx.is_closed(),
            None => true,
        }
    }
}

/// Consumer half of a frame bus.
pub struct FrameReceiver<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> FrameReceiver<T> {
    /// Receive the next frame in send order.
    pub async fn recv(&mut self) -> Result<T, RecvError> {
        self.rx.recv().await.ok_or(RecvError::Closed)
    }

    /// Close the consumer side. Idempotent. Buffered frames remain
    /// receivable; subsequent producer sends fail with `Discarded`.
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Non-blocking receive, for drain loops during teardown.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}
