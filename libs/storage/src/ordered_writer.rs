//! Order-restoring sink for parallel ranged downloads.

use std::collections::BTreeMap;
use std::io;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Accepts `(offset, bytes)` writes in any order and forwards them to the
/// downstream writer strictly in contiguous offset order starting at 0.
///
/// Out-of-order chunks are buffered keyed by offset; each write drains the
/// run of buffered chunks that extends the flushed prefix. Shared across the
/// part-fetch tasks of one download, hence the lock.
pub struct OrderedWriter<W> {
    state: Mutex<State<W>>,
}

struct State<W> {
    dest: W,
    next_offset: u64,
    pending: BTreeMap<u64, Bytes>,
}

impl<W: AsyncWrite + Unpin + Send> OrderedWriter<W> {
    pub fn new(dest: W) -> Self {
        Self {
            state: Mutex::new(State {
                dest,
                next_offset: 0,
                pending: BTreeMap::new(),
            }),
        }
    }

    pub async fn write_at(&self, offset: u64, data: Bytes) -> io::Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.pending.insert(offset, data);
        loop {
            let next = state.next_offset;
            let Some(chunk) = state.pending.remove(&next) else {
                break;
            };
            state.dest.write_all(&chunk).await?;
            state.next_offset = next + chunk.len() as u64;
        }
        Ok(())
    }

    /// Flushes the downstream writer once the contiguous prefix has reached
    /// `total` bytes. A shorter prefix means a part never arrived, which is
    /// an integrity failure.
    pub async fn finish(self, total: u64) -> io::Result<W> {
        let mut state = self.state.into_inner();
        if state.next_offset != total || !state.pending.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!(
                    "incomplete download: flushed {} of {} bytes",
                    state.next_offset, total
                ),
            ));
        }
        state.dest.flush().await?;
        Ok(state.dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(parts: Vec<(u64, &'static [u8])>) -> io::Result<Vec<u8>> {
        let total: u64 = parts.iter().map(|(_, b)| b.len() as u64).sum();
        let writer = OrderedWriter::new(Vec::new());
        for (offset, data) in parts {
            writer.write_at(offset, Bytes::from_static(data)).await?;
        }
        writer.finish(total).await
    }

    #[tokio::test]
    async fn in_order_writes_stream_through() {
        let out = run(vec![(0, b"ab"), (2, b"cd"), (4, b"e")]).await.unwrap();
        assert_eq!(out, b"abcde");
    }

    #[tokio::test]
    async fn out_of_order_writes_are_reordered() {
        let out = run(vec![(4, b"e"), (0, b"ab"), (2, b"cd")]).await.unwrap();
        assert_eq!(out, b"abcde");

        let out = run(vec![(2, b"cd"), (4, b"e"), (0, b"ab")]).await.unwrap();
        assert_eq!(out, b"abcde");
    }

    #[tokio::test]
    async fn concurrent_writers_produce_offset_order() {
        let data: Vec<u8> = (0..=255).collect();
        let writer = std::sync::Arc::new(OrderedWriter::new(Vec::new()));
        let mut handles = Vec::new();
        // Reverse submission order to force maximal buffering.
        for part in (0..16).rev() {
            let writer = writer.clone();
            let chunk = Bytes::copy_from_slice(&data[part * 16..(part + 1) * 16]);
            handles.push(tokio::spawn(async move {
                writer.write_at(part as u64 * 16, chunk).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let writer = std::sync::Arc::try_unwrap(writer).ok().unwrap();
        let out = writer.finish(256).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn missing_part_fails_finish() {
        let writer = OrderedWriter::new(Vec::new());
        writer.write_at(2, Bytes::from_static(b"cd")).await.unwrap();
        let err = writer.finish(4).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }

    #[tokio::test]
    async fn empty_object_finishes_at_zero() {
        let writer = OrderedWriter::new(Vec::new());
        let out = writer.finish(0).await.unwrap();
        assert!(out.is_empty());
    }
}
