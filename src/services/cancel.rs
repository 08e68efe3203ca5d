//! Cancellation plumbing shared by turns and uploads: a `watch` channel
//! carrying a single boolean, flipped once by the owning handle.

use tokio::sync::watch;

pub type CancelSender = watch::Sender<bool>;
pub type CancelReceiver = watch::Receiver<bool>;

pub fn cancel_channel() -> (CancelSender, CancelReceiver) {
    watch::channel(false)
}

pub fn is_cancelled(cancel: &CancelReceiver) -> bool {
    *cancel.borrow()
}

/// Resolves once cancellation is requested. If the sender is dropped without
/// cancelling, this never resolves; callers race it against real work in
/// `tokio::select!`.
pub async fn cancelled(cancel: &mut CancelReceiver) {
    if *cancel.borrow() {
        return;
    }
    while cancel.changed().await.is_ok() {
        if *cancel.borrow() {
            return;
        }
    }
    std::future::pending::<()>().await
}
