//! Response bodies and the size-capped upstream pipe
//!
//! Upstream bytes are read by a producer task and handed to the client body
//! through a bounded channel. The producer stops reading upstream as soon as
//! the client body is dropped or the running byte count crosses the limit.

use std::convert::Infallible;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, warn};

use crate::error::RelayError;

/// Body type of every response produced by the relay
pub type RelayBody = BoxBody<Bytes, RelayError>;

/// Chunks buffered between the upstream reader and the client writer
pub const PIPE_CAPACITY: usize = 16;

/// Build a body from an in-memory buffer
pub fn full(data: impl Into<Bytes>) -> RelayBody {
    Full::new(data.into())
        .map_err(|never: Infallible| match never {})
        .boxed()
}

/// Build an empty body
pub fn empty() -> RelayBody {
    Empty::<Bytes>::new()
        .map_err(|never: Infallible| match never {})
        .boxed()
}

/// Relay `upstream` to the client, aborting once more than `limit` bytes flow.
///
/// Exceeding the limit or an upstream read error ends the body with an error
/// frame, which makes the server tear the client connection down instead of
/// finishing the response cleanly.
pub fn capped_pipe<S, E>(upstream: S, limit: u64, target_url: String) -> RelayBody
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<RelayError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<Frame<Bytes>, RelayError>>(PIPE_CAPACITY);

    tokio::spawn(async move {
        let mut upstream = std::pin::pin!(upstream);
        let mut relayed: u64 = 0;

        loop {
            let next = tokio::select! {
                chunk = upstream.next() => chunk,
                _ = tx.closed() => {
                    debug!(target_url = %target_url, relayed, "Client went away, cancelling upstream read");
                    return;
                }
            };

            match next {
                Some(Ok(chunk)) => {
                    relayed += chunk.len() as u64;

                    if relayed > limit {
                        warn!(
                            target_url = %target_url,
                            relayed,
                            limit,
                            "Response exceeded size limit, aborting"
                        );
                        let _ = tx.send(Err(RelayError::PayloadTooLarge { limit })).await;
                        return;
                    }

                    if tx.send(Ok(Frame::data(chunk))).await.is_err() {
                        debug!(target_url = %target_url, relayed, "Client went away mid-stream");
                        return;
                    }
                }
                Some(Err(e)) => {
                    let e: RelayError = e.into();
                    error!(target_url = %target_url, relayed, error = %e, "Upstream read failed");
                    let _ = tx.send(Err(e)).await;
                    return;
                }
                None => {
                    debug!(target_url = %target_url, relayed, "Upstream response complete");
                    return;
                }
            }
        }
    });

    BodyExt::boxed(StreamBody::new(ReceiverStream::new(rx)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn chunks(parts: &[&'static [u8]]) -> Vec<Result<Bytes, RelayError>> {
        parts.iter().map(|p| Ok(Bytes::from_static(p))).collect()
    }

    #[tokio::test]
    async fn test_pipe_relays_everything_under_limit() {
        let upstream = futures::stream::iter(chunks(&[b"hello ", b"world"]));
        let body = capped_pipe(upstream, 11, "http://example.com/".to_string());

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"hello world");
    }

    #[tokio::test]
    async fn test_pipe_errors_once_limit_is_crossed() {
        let upstream = futures::stream::iter(chunks(&[b"12345", b"67890", b"abc"]));
        let body = capped_pipe(upstream, 8, "http://example.com/".to_string());

        let err = body.collect().await.unwrap_err();
        assert!(matches!(err, RelayError::PayloadTooLarge { limit: 8 }));
    }

    #[tokio::test]
    async fn test_pipe_stops_reading_after_limit() {
        let polled = Arc::new(AtomicUsize::new(0));
        let counter = polled.clone();
        let upstream = futures::stream::iter(0..100).map(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, RelayError>(Bytes::from_static(b"0123456789"))
        });

        let body = capped_pipe(upstream, 25, "http://example.com/".to_string());
        assert!(body.collect().await.is_err());

        // Third chunk crosses 25 bytes; nothing after it is pulled.
        assert_eq!(polled.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_pipe_cancels_upstream_when_client_drops() {
        let (upstream_tx, upstream_rx) = mpsc::channel::<Result<Bytes, RelayError>>(1);
        let body = capped_pipe(
            ReceiverStream::new(upstream_rx),
            1024,
            "http://example.com/".to_string(),
        );

        drop(body);

        // The producer notices the closed pipe and drops the upstream stream.
        tokio::time::timeout(Duration::from_secs(1), upstream_tx.closed())
            .await
            .expect("upstream read was not cancelled");
    }

    #[tokio::test]
    async fn test_pipe_propagates_upstream_error() {
        let upstream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(RelayError::Internal("reset".to_string())),
        ]);
        let body = capped_pipe(upstream, 1024, "http://example.com/".to_string());

        let err = body.collect().await.unwrap_err();
        assert!(matches!(err, RelayError::Internal(_)));
    }
}
