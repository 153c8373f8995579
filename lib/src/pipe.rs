//! Bridges the push-style merge producer to a pull-driven byte stream.

use std::{future::Future, io};

use futures_lite::StreamExt;
use tokio::io::DuplexStream;
use tokio_util::io::ReaderStream;

use crate::merge::{MergeError, MergeStream};

/// Bytes buffered between producer and consumer; the producer only advances
/// while the consumer keeps pulling.
const CAPACITY: usize = 64 * 1024;

/// Spawn `produce` writing into one end of a bounded in-memory pipe and
/// return the pull side as a stream.
///
/// The producer's error, if any, surfaces on the pull after the buffered
/// prefix drains; whatever was already emitted stays emitted. Dropping the
/// stream closes the pipe, which fails the producer's next write and tears
/// the merge down, releasing any open layer.
pub(crate) fn stream_producer<F, Fut>(produce: F) -> MergeStream
where
    F: FnOnce(DuplexStream) -> Fut,
    Fut: Future<Output = Result<(), MergeError>> + Send + 'static,
{
    let (writer, reader) = tokio::io::duplex(CAPACITY);
    let producer = tokio::spawn(produce(writer));

    Box::pin(async_stream::stream! {
        let mut chunks = ReaderStream::new(reader);
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(bytes) => yield Ok(bytes),
                Err(err) => {
                    yield Err(MergeError::Write(err));
                    return;
                }
            }
        }

        match producer.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => yield Err(err),
            Err(err) => yield Err(MergeError::Write(io::Error::other(err))),
        }
    })
}
