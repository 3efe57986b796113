use std::{
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use axum::http::HeaderMap;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hyper::body::{Body, Frame, SizeHint};
use tracing::warn;

use super::SubstitutionPair;

/// Per-response line buffer. Holds at most one unfinished line between
/// chunks and emits every completed line with the substitution applied.
#[derive(Debug)]
pub struct LineRewriter {
    pair: Arc<SubstitutionPair>,
    buffer: BytesMut,
    /// Bytes at the front of `buffer` already known to hold no line feed.
    scanned: usize,
    max_line: usize,
}

impl LineRewriter {
    pub fn new(pair: Arc<SubstitutionPair>, max_line: usize) -> Self {
        Self {
            pair,
            buffer: BytesMut::new(),
            scanned: 0,
            max_line,
        }
    }

    /// Feeds one chunk and returns whatever became ready to send. The result
    /// is empty when the chunk did not complete a line.
    pub fn push(&mut self, chunk: &[u8]) -> Bytes {
        self.buffer.extend_from_slice(chunk);
        let mut out = BytesMut::with_capacity(self.buffer.len());

        while let Some(offset) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            let line = self.buffer.split_to(end + 1);
            self.pair.substitute(&line[..end], &mut out, false);
            out.put_u8(b'\n');
            self.scanned = 0;
        }
        self.scanned = self.buffer.len();

        // Oversized partial line: flush it but hold back a possible match prefix.
        if self.buffer.len() > self.max_line {
            let consumed = self.pair.substitute(&self.buffer, &mut out, true);
            self.buffer.advance(consumed);
            self.scanned = self.buffer.len();
        }

        out.freeze()
    }

    /// Rewrites and returns the unterminated tail once the body has ended.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = self.buffer.split();
        self.scanned = 0;
        let mut out = BytesMut::with_capacity(rest.len());
        self.pair.substitute(&rest, &mut out, false);
        Some(out.freeze())
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Response body wrapper. In rewriting mode data frames go through a
/// [`LineRewriter`]; in pass-through mode frames are forwarded untouched.
///
/// The declared size is never forwarded, so the server falls back to
/// chunked transfer instead of trusting a stale length.
#[derive(Debug)]
pub struct RewriteBody<B> {
    inner: B,
    lines: Option<LineRewriter>,
    trailers: Option<HeaderMap>,
    done: bool,
}

impl<B> RewriteBody<B> {
    pub fn passthrough(inner: B) -> Self {
        Self {
            inner,
            lines: None,
            trailers: None,
            done: false,
        }
    }

    pub fn rewriting(inner: B, pair: Arc<SubstitutionPair>, max_line: usize) -> Self {
        Self {
            inner,
            lines: Some(LineRewriter::new(pair, max_line)),
            trailers: None,
            done: false,
        }
    }

    #[cfg(test)]
    fn is_rewriting(&self) -> bool {
        self.lines.is_some()
    }
}

impl<B> Body for RewriteBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
        let this = self.get_mut();

        loop {
            if this.done {
                return Poll::Ready(this.trailers.take().map(|t| Ok(Frame::trailers(t))));
            }

            let Some(lines) = this.lines.as_mut() else {
                let frame = ready!(Pin::new(&mut this.inner).poll_frame(cx));
                match &frame {
                    None => this.done = true,
                    Some(Err(err)) => {
                        warn!(target: "rebase_proxy::rewrite", error = %err, "Upstream body failed")
                    }
                    Some(Ok(_)) => {}
                }
                return Poll::Ready(frame);
            };

            match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => {
                        let out = lines.push(&data);
                        if !out.is_empty() {
                            return Poll::Ready(Some(Ok(Frame::data(out))));
                        }
                    }
                    Err(frame) => {
                        // Trailers end the body; the tail must go out first.
                        this.done = true;
                        this.trailers = frame.into_trailers().ok();
                        if let Some(rest) = lines.finish() {
                            return Poll::Ready(Some(Ok(Frame::data(rest))));
                        }
                    }
                },
                Some(Err(err)) => {
                    warn!(
                        target: "rebase_proxy::rewrite",
                        error = %err,
                        pending = lines.buffer.len(),
                        "Upstream body failed mid-rewrite"
                    );
                    return Poll::Ready(Some(Err(err)));
                }
                None => {
                    this.done = true;
                    if let Some(rest) = lines.finish() {
                        return Poll::Ready(Some(Ok(Frame::data(rest))));
                    }
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done && self.trailers.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::default()
    }
}
