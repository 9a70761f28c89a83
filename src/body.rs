//! Response body observation.
//!
//! [`ObservedBody`] decorates the outgoing response body: every frame is passed
//! through untouched while data-frame lengths are recorded on the request's
//! [`ResponseObserver`](crate::ResponseObserver). When the stream ends, errors,
//! or is dropped, the access record for the request is emitted.

use axum::body::Body;
use bytes::Bytes;
use http_body::{Body as HttpBody, Frame, SizeHint};
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::recovery::{RecoveredPanic, INTERNAL_ERROR_TEXT};
use crate::scope::RequestScope;

/// Body wrapper that counts the bytes it forwards.
///
/// A panic raised while polling the inner body is recovered: it is reported like
/// a handler panic, the status already sent stays as it is, the
/// `Internal Server Error` text is appended as a last data frame and the stream
/// ends.
pub struct ObservedBody {
    inner: Body,
    scope: RequestScope,
    done: bool,
}

impl ObservedBody {
    pub(crate) fn new(inner: Body, scope: RequestScope) -> Self {
        Self {
            inner,
            scope,
            done: false,
        }
    }

    fn complete(&mut self) {
        self.done = true;
        self.scope.finish();
    }
}

impl HttpBody for ObservedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        let inner = &mut this.inner;
        let polled = panic::catch_unwind(AssertUnwindSafe(|| Pin::new(inner).poll_frame(cx)));

        match polled {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(Some(Ok(frame)))) => {
                if let Some(data) = frame.data_ref() {
                    this.scope.observer_mut().record_write(data.len());
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Ok(Poll::Ready(Some(Err(e)))) => {
                this.complete();
                Poll::Ready(Some(Err(e)))
            }
            Ok(Poll::Ready(None)) => {
                this.complete();
                Poll::Ready(None)
            }
            Err(payload) => {
                this.scope.report_panic(&RecoveredPanic::capture(payload));
                let tail = Bytes::from_static(INTERNAL_ERROR_TEXT.as_bytes());
                this.scope.observer_mut().record_write(tail.len());
                this.complete();
                Poll::Ready(Some(Ok(Frame::data(tail))))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        if self.done {
            SizeHint::with_exact(0)
        } else {
            self.inner.size_hint()
        }
    }
}
