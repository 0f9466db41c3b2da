//! Streaming infrastructure: lazy pull streams over upstream body chunks,
//! with the small adapter set the pipeline composes.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Stream, StreamExt, stream};
use tokio::sync::mpsc::Receiver;

use axonhub_model::{GatewayError, Response};
use axonhub_protocol::sse::{SseEvent, SseParser};

/// A boxed lazy stream of neutral results.
pub type EventStream<T> = Pin<Box<dyn Stream<Item = Result<T, GatewayError>> + Send>>;

/// Incrementally decode SSE events out of raw upstream body chunks.
///
/// Dropping the stream drops the receiver, which propagates cancellation to
/// the producer task within one send.
pub struct SseEventStream {
    rx: Receiver<Bytes>,
    parser: SseParser,
    pending: VecDeque<SseEvent>,
    finished: bool,
}

impl SseEventStream {
    pub fn new(rx: Receiver<Bytes>) -> Self {
        Self {
            rx,
            parser: SseParser::new(),
            pending: VecDeque::new(),
            finished: false,
        }
    }
}

impl Stream for SseEventStream {
    type Item = SseEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Poll::Ready(Some(event));
            }
            if self.finished {
                return Poll::Ready(None);
            }
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    let events = self.parser.push_bytes(&chunk);
                    self.pending.extend(events);
                }
                Poll::Ready(None) => {
                    self.finished = true;
                    let events = self.parser.finish();
                    self.pending.extend(events);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Map each element of a neutral stream, forwarding errors in order.
pub fn map_events<T, U, F>(input: EventStream<T>, f: F) -> EventStream<U>
where
    T: 'static,
    U: 'static,
    F: FnMut(T) -> U + Send + 'static,
{
    let mut f = f;
    Box::pin(input.map(move |item| item.map(&mut f)))
}

/// Yield the end-of-stream sentinel after the source exhausts.
pub fn append_done(input: EventStream<Response>) -> EventStream<Response> {
    Box::pin(input.chain(stream::once(async { Ok(Response::done()) })))
}

/// Drop `None` elements from a stream of optional results.
pub fn filter_nones<T>(input: EventStream<Option<T>>) -> EventStream<T>
where
    T: Send + 'static,
{
    Box::pin(input.filter_map(|item| async move {
        match item {
            Ok(Some(value)) => Some(Ok(value)),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sse_stream_decodes_split_frames_in_order() {
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        let handle = tokio::spawn(async move {
            tx.send(Bytes::from_static(b"data: one\n\nda")).await.unwrap();
            tx.send(Bytes::from_static(b"ta: two\n\ndata: tail")).await.unwrap();
        });
        let events: Vec<SseEvent> = SseEventStream::new(rx).collect().await;
        handle.await.unwrap();
        let data: Vec<&str> = events.iter().map(|event| event.data.as_str()).collect();
        assert_eq!(data, vec!["one", "two", "tail"]);
    }

    #[tokio::test]
    async fn adapters_compose() {
        let source: EventStream<Option<i32>> = Box::pin(stream::iter(vec![
            Ok(Some(1)),
            Ok(None),
            Ok(Some(2)),
        ]));
        let doubled = map_events(filter_nones(source), |value| value * 2);
        let values: Vec<i32> = doubled.map(Result::unwrap).collect().await;
        assert_eq!(values, vec![2, 4]);
    }

    #[tokio::test]
    async fn append_done_yields_sentinel_last_exactly_once() {
        let source: EventStream<Response> =
            Box::pin(stream::iter(vec![Ok(Response::default())]));
        let items: Vec<Response> = append_done(source).map(Result::unwrap).collect().await;
        assert_eq!(items.len(), 2);
        assert!(!items[0].is_done());
        assert!(items[1].is_done());
    }
}
