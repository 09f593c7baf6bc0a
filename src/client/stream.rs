//! Reply stream for a single request.

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;

use super::replies::ReplyHandle;
use crate::codec::WritePacket;
use crate::error::Result;

/// Replies to one request, in arrival order.
///
/// Yields each response value and ends after the terminal reply. An error
/// reply is yielded once as `Err` and ends the stream. Dropping the stream
/// deregisters the request; later replies for it are discarded.
pub struct ReplyStream {
    replies: mpsc::UnboundedReceiver<WritePacket>,
    handle: ReplyHandle,
    done: bool,
}

impl ReplyStream {
    pub(crate) fn new(replies: mpsc::UnboundedReceiver<WritePacket>, handle: ReplyHandle) -> Self {
        Self {
            replies,
            handle,
            done: false,
        }
    }

    /// Correlation id of the underlying request.
    pub fn correlation_id(&self) -> &str {
        self.handle.correlation_id()
    }

    /// Stop listening for replies.
    pub fn cancel(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        self.done = true;
        self.handle.cancel();
        self.replies.close();
    }
}

impl Stream for ReplyStream {
    type Item = Result<Value>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.done {
                return Poll::Ready(None);
            }
            let Some(packet) = ready!(this.replies.poll_recv(cx)) else {
                this.finish();
                return Poll::Ready(None);
            };

            if let Some(err) = packet.err {
                this.finish();
                return Poll::Ready(Some(Err(err)));
            }
            if packet.is_disposed {
                this.finish();
            }
            if let Some(value) = packet.response {
                return Poll::Ready(Some(Ok(value)));
            }
        }
    }
}

impl Drop for ReplyStream {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}
