//! Memory-bounded sort for record streams.
//!
//! Records flow in over a channel, get collected into fixed-size chunks,
//! sorted by a worker pool, and spilled as length-prefixed frames to a single
//! append-only temporary file. Once the input is exhausted a k-way heap merge
//! over the spilled chunks replays the records in order onto the output
//! channel.
//!
//! The spill file is a [`camino_tempfile`] handle, so it disappears on drop
//! even when the sort aborts early.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use camino::Utf8PathBuf;
use camino_tempfile::NamedUtf8TempFile;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum SortError {
    #[error("sort spill i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt spill record: {0}")]
    Codec(String),
    #[error("sort consumer went away")]
    Cancelled,
}

/// Knobs for the sort pipeline. The defaults keep roughly
/// `chunk_size * workers` records in flight.
#[derive(Debug, Clone)]
pub struct SortConfig {
    /// Records per in-memory chunk.
    pub chunk_size: usize,
    /// Concurrent chunk sorters.
    pub workers: usize,
    /// Buffer of the channel feeding sorted chunks to the spill writer.
    pub chunk_buffer: usize,
    /// Buffer of the ordered output channel.
    pub output_buffer: usize,
    /// Spill directory; the system temp dir when unset.
    pub temp_dir: Option<Utf8PathBuf>,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100_000,
            workers: 4,
            chunk_buffer: 8,
            output_buffer: 1000,
            temp_dir: None,
        }
    }
}

/// Encode/decode pair used to frame records in the spill file.
pub struct Codec<T> {
    pub encode: Arc<dyn Fn(&T) -> Vec<u8> + Send + Sync>,
    pub decode: Arc<dyn Fn(&[u8]) -> Result<T, String> + Send + Sync>,
}

impl<T> Clone for Codec<T> {
    fn clone(&self) -> Self {
        Self {
            encode: self.encode.clone(),
            decode: self.decode.clone(),
        }
    }
}

type LessFn<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Starts the sort pipeline over `input`. Returns the ordered output channel
/// and an error channel; the error channel yields at most one error, and the
/// output channel closes right after.
pub fn sort<T>(
    mut input: mpsc::Receiver<T>,
    codec: Codec<T>,
    less: LessFn<T>,
    config: SortConfig,
) -> (mpsc::Receiver<T>, mpsc::Receiver<SortError>)
where
    T: Send + 'static,
{
    let (output_tx, output_rx) = mpsc::channel(config.output_buffer.max(1));
    let (err_tx, err_rx) = mpsc::channel(1);

    let (raw_chunk_tx, raw_chunk_rx) = mpsc::channel::<Vec<T>>(1);
    let (sorted_chunk_tx, sorted_chunk_rx) = mpsc::channel::<Vec<T>>(config.chunk_buffer.max(1));

    // Builder: batch the input into chunks.
    let chunk_size = config.chunk_size.max(1);
    tokio::spawn(async move {
        let mut chunk = Vec::with_capacity(chunk_size);
        while let Some(record) = input.recv().await {
            chunk.push(record);
            if chunk.len() >= chunk_size {
                let full = std::mem::replace(&mut chunk, Vec::with_capacity(chunk_size));
                if raw_chunk_tx.send(full).await.is_err() {
                    return;
                }
            }
        }
        if !chunk.is_empty() {
            let _ = raw_chunk_tx.send(chunk).await;
        }
    });

    // Sorter pool: each worker pulls a raw chunk, sorts it off the runtime,
    // and hands it to the spill writer.
    let shared_rx = Arc::new(tokio::sync::Mutex::new(raw_chunk_rx));
    for _ in 0..config.workers.max(1) {
        let shared_rx = Arc::clone(&shared_rx);
        let sorted_chunk_tx = sorted_chunk_tx.clone();
        let less = less.clone();
        tokio::spawn(async move {
            loop {
                let chunk = { shared_rx.lock().await.recv().await };
                let Some(mut chunk) = chunk else { break };
                let less = less.clone();
                let sorted = tokio::task::spawn_blocking(move || {
                    chunk.sort_by(|a, b| less(a, b));
                    chunk
                })
                .await;
                match sorted {
                    Ok(sorted) => {
                        if sorted_chunk_tx.send(sorted).await.is_err() {
                            break;
                        }
                    }
                    Err(join_err) => {
                        tracing::error!("chunk sorter panicked: {join_err}");
                        break;
                    }
                }
            }
        });
    }
    drop(sorted_chunk_tx);

    // Saver + merger share one blocking thread: spill every sorted chunk,
    // then merge the spilled chunks back in order.
    let temp_dir = config
        .temp_dir
        .clone()
        .or_else(|| Utf8PathBuf::from_path_buf(std::env::temp_dir()).ok())
        .unwrap_or_else(|| Utf8PathBuf::from("."));
    tokio::task::spawn_blocking(move || {
        if let Err(err) = save_and_merge(sorted_chunk_rx, codec, less, &temp_dir, output_tx) {
            let _ = err_tx.blocking_send(err);
        }
    });

    (output_rx, err_rx)
}

/// Byte span of one sorted chunk inside the spill file.
struct ChunkSpan {
    start: u64,
    len: u64,
}

fn save_and_merge<T: Send + 'static>(
    mut chunks: mpsc::Receiver<Vec<T>>,
    codec: Codec<T>,
    less: LessFn<T>,
    temp_dir: &Utf8PathBuf,
    output: mpsc::Sender<T>,
) -> Result<(), SortError> {
    let spill = camino_tempfile::Builder::new()
        .prefix("s3bulk-sort-")
        .tempfile_in(temp_dir)?;

    let mut spans = Vec::new();
    let mut offset = 0u64;
    {
        let mut writer = BufWriter::new(spill.as_file());
        while let Some(chunk) = chunks.blocking_recv() {
            let start = offset;
            for record in &chunk {
                let frame = (codec.encode)(record);
                let len = u32::try_from(frame.len())
                    .map_err(|_| SortError::Codec("record over 4GiB".to_string()))?;
                writer.write_all(&len.to_le_bytes())?;
                writer.write_all(&frame)?;
                offset += 4 + frame.len() as u64;
            }
            spans.push(ChunkSpan {
                start,
                len: offset - start,
            });
        }
        writer.flush()?;
    }

    merge_spans(spill, spans, codec, less, output)
}

struct ChunkCursor {
    reader: BufReader<File>,
    remaining: u64,
}

impl ChunkCursor {
    fn open(path: &camino::Utf8Path, span: &ChunkSpan) -> Result<Self, SortError> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(span.start))?;
        Ok(Self {
            reader: BufReader::new(file),
            remaining: span.len,
        })
    }

    fn next<T>(&mut self, codec: &Codec<T>) -> Result<Option<T>, SortError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let mut len_buf = [0u8; 4];
        self.reader.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut frame = vec![0u8; len];
        self.reader.read_exact(&mut frame)?;
        self.remaining = self
            .remaining
            .checked_sub(4 + len as u64)
            .ok_or_else(|| SortError::Codec("chunk span underflow".to_string()))?;
        (codec.decode)(&frame).map(Some).map_err(SortError::Codec)
    }
}

struct HeapEntry<T> {
    record: T,
    cursor: usize,
    less: LessFn<T>,
}

impl<T> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        (self.less)(&self.record, &other.record) == Ordering::Equal
    }
}
impl<T> Eq for HeapEntry<T> {}
impl<T> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for HeapEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; flip for smallest-first.
        (self.less)(&self.record, &other.record).reverse()
    }
}

fn merge_spans<T: Send + 'static>(
    spill: NamedUtf8TempFile,
    spans: Vec<ChunkSpan>,
    codec: Codec<T>,
    less: LessFn<T>,
    output: mpsc::Sender<T>,
) -> Result<(), SortError> {
    let mut cursors = Vec::with_capacity(spans.len());
    for span in &spans {
        cursors.push(ChunkCursor::open(spill.path(), span)?);
    }

    let mut heap = BinaryHeap::with_capacity(cursors.len());
    for (idx, cursor) in cursors.iter_mut().enumerate() {
        if let Some(record) = cursor.next(&codec)? {
            heap.push(HeapEntry {
                record,
                cursor: idx,
                less: less.clone(),
            });
        }
    }

    while let Some(entry) = heap.pop() {
        let HeapEntry { record, cursor, .. } = entry;
        output
            .blocking_send(record)
            .map_err(|_| SortError::Cancelled)?;
        if let Some(record) = cursors[cursor].next(&codec)? {
            heap.push(HeapEntry {
                record,
                cursor,
                less: less.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn string_codec() -> Codec<String> {
        Codec {
            encode: Arc::new(|s: &String| s.as_bytes().to_vec()),
            decode: Arc::new(|b: &[u8]| {
                String::from_utf8(b.to_vec()).map_err(|e| e.to_string())
            }),
        }
    }

    async fn run_sort(input: Vec<String>, config: SortConfig) -> Vec<String> {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for item in input {
                tx.send(item).await.unwrap();
            }
        });
        let (mut out, mut errs) = sort(
            rx,
            string_codec(),
            Arc::new(|a: &String, b: &String| a.cmp(b)),
            config,
        );
        let mut got = Vec::new();
        while let Some(item) = out.recv().await {
            got.push(item);
        }
        assert!(errs.try_recv().is_err(), "unexpected sort error");
        got
    }

    #[tokio::test]
    async fn output_is_sorted_permutation() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut input: Vec<String> = (0..5000).map(|i| format!("key-{:05}", i)).collect();
        input.shuffle(&mut rng);

        let got = run_sort(
            input.clone(),
            SortConfig {
                chunk_size: 128,
                workers: 3,
                ..Default::default()
            },
        )
        .await;

        let mut expect = input;
        expect.sort();
        assert_eq!(got, expect);
    }

    #[tokio::test]
    async fn empty_input_closes_output() {
        let got = run_sort(Vec::new(), SortConfig::default()).await;
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn single_chunk_passes_through_ordered() {
        let input = vec!["c".to_string(), "a".to_string(), "b".to_string()];
        let got = run_sort(input, SortConfig::default()).await;
        assert_eq!(got, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn duplicate_keys_survive_merge() {
        let input = vec!["b", "a", "b", "a", "a"]
            .into_iter()
            .map(str::to_string)
            .collect();
        let got = run_sort(
            input,
            SortConfig {
                chunk_size: 2,
                workers: 2,
                ..Default::default()
            },
        )
        .await;
        assert_eq!(got, vec!["a", "a", "a", "b", "b"]);
    }
}
