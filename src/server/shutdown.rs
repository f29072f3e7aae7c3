use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Returns a handle/signal pair. The signal resolves once the handle is dropped, so a server
/// lives exactly as long as whoever owns the handle.
pub(crate) fn shutdown_signal() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = oneshot::channel();

    (ShutdownHandle { _tx: tx }, ShutdownSignal { rx })
}

pub(crate) struct ShutdownHandle {
    _tx: oneshot::Sender<()>,
}

pub(crate) struct ShutdownSignal {
    rx: oneshot::Receiver<()>,
}

impl Future for ShutdownSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let rx = Pin::new(&mut self.rx);

        match rx.poll(cx) {
            Poll::Pending => Poll::Pending,
            // We don't care if oneshot Sender sent value or dropped
            Poll::Ready(_) => Poll::Ready(()),
        }
    }
}
