//! Pull-style sample readers.
//!
//! Both readers take ownership of an opened and configured [`Fobos`], run
//! [`Fobos::read_async`] on a background thread and hand each delivered
//! buffer over a bounded channel. When the consumer falls behind, buffers
//! are dropped and counted as overruns rather than stalling the stream.

use crate::config::FobosConfig;
use crate::device::Fobos;
use crate::error::Result;
use crate::stream::CancelHandle;
use futures::Stream;
use num_complex::Complex;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::{self, Receiver, error::TrySendError};

/// Buffers queued between the streaming thread and the consumer.
pub const CHANNEL_DEPTH: usize = 32;

const STOP_POLL: Duration = Duration::from_millis(10);

type Chunk = Result<Vec<Complex<f32>>>;

struct StreamThread {
    cancel: CancelHandle,
    overruns: Arc<AtomicU64>,
    handle: Option<JoinHandle<Fobos>>,
}

impl StreamThread {
    fn spawn(mut dev: Fobos, buf_count: u32, buf_length: u32) -> (Self, Receiver<Chunk>) {
        let (tx, rx) = mpsc::channel::<Chunk>(CHANNEL_DEPTH);
        let cancel = dev.cancel_handle();
        let overruns = Arc::new(AtomicU64::new(0));

        let handle = {
            let cancel = cancel.clone();
            let overruns = overruns.clone();
            std::thread::spawn(move || {
                let result = dev.read_async(
                    |samples| match tx.try_send(Ok(samples.to_vec())) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            overruns.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(TrySendError::Closed(_)) => {
                            let _ = cancel.cancel();
                        }
                    },
                    buf_count,
                    buf_length,
                );
                if let Err(e) = result {
                    tracing::warn!("Stream ended: {}", e);
                    // wait for room so the consumer always sees why it ended
                    if tx.blocking_send(Err(e)).is_err() {
                        tracing::debug!("Reader dropped before the stream error");
                    }
                }
                dev
            })
        };

        (
            StreamThread {
                cancel,
                overruns,
                handle: Some(handle),
            },
            rx,
        )
    }

    fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Cancel until the streaming thread exits, then take the device back.
    fn stop(&mut self) -> Option<Fobos> {
        let handle = self.handle.take()?;
        // the stream may not have started yet, keep asking
        while !handle.is_finished() {
            let _ = self.cancel.cancel();
            std::thread::sleep(STOP_POLL);
        }
        match handle.join() {
            Ok(dev) => Some(dev),
            Err(_) => {
                tracing::warn!("Streaming thread panicked");
                None
            }
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Blocking reader yielding one buffer of samples per item.
///
/// ```no_run
/// use fobos::{FobosConfig, FobosReader};
///
/// let config = FobosConfig::new(0, 100e6, 10e6).with_gains(1, 8);
/// let reader = FobosReader::new(config.open()?, config.buf_count, config.buf_length);
/// for chunk in reader.take(10) {
///     println!("{} samples", chunk?.len());
/// }
/// # Ok::<(), fobos::Error>(())
/// ```
pub struct FobosReader {
    rx: Receiver<Chunk>,
    thread: StreamThread,
}

impl FobosReader {
    pub fn new(dev: Fobos, buf_count: u32, buf_length: u32) -> Self {
        let (thread, rx) = StreamThread::spawn(dev, buf_count, buf_length);
        FobosReader { rx, thread }
    }

    pub fn from_config(config: &FobosConfig) -> Result<Self> {
        Ok(Self::new(config.open()?, config.buf_count, config.buf_length))
    }

    /// Buffers dropped because the consumer was too slow.
    pub fn overruns(&self) -> u64 {
        self.thread.overruns()
    }

    /// Stop streaming and hand the device back.
    pub fn stop(self) -> Option<Fobos> {
        let FobosReader { rx, mut thread } = self;
        drop(rx);
        thread.stop()
    }
}

impl Iterator for FobosReader {
    type Item = Chunk;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.blocking_recv()
    }
}

/// Asynchronous reader implementing [`futures::Stream`].
pub struct AsyncFobosReader {
    rx: Receiver<Chunk>,
    thread: StreamThread,
}

impl AsyncFobosReader {
    pub fn new(dev: Fobos, buf_count: u32, buf_length: u32) -> Self {
        let (thread, rx) = StreamThread::spawn(dev, buf_count, buf_length);
        AsyncFobosReader { rx, thread }
    }

    pub fn from_config(config: &FobosConfig) -> Result<Self> {
        Ok(Self::new(config.open()?, config.buf_count, config.buf_length))
    }

    pub fn overruns(&self) -> u64 {
        self.thread.overruns()
    }

    /// Stop streaming and hand the device back. Blocks until the
    /// streaming thread has exited.
    pub fn stop(self) -> Option<Fobos> {
        let AsyncFobosReader { rx, mut thread } = self;
        drop(rx);
        thread.stop()
    }
}

impl Stream for AsyncFobosReader {
    type Item = Chunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::encode_sample;
    use crate::error::Error;
    use crate::sim::{BulkFrame, SimulatedTransport, tone_pattern};
    use crate::stream::AsyncStatus;
    use futures::StreamExt;

    fn encode_square(samples: usize) -> Vec<u8> {
        (0..samples)
            .flat_map(|n| {
                let v = if n % 2 == 0 { 1000 } else { -1000 };
                let mut bytes = encode_sample(v).to_le_bytes().to_vec();
                bytes.extend_from_slice(&encode_sample(v / 2).to_le_bytes());
                bytes
            })
            .collect()
    }

    fn simulated() -> (SimulatedTransport, Fobos) {
        let sim = SimulatedTransport::new();
        sim.set_pattern(tone_pattern(64, 4000));
        let dev = Fobos::with_transport(Box::new(sim.clone()));
        (sim, dev)
    }

    #[test]
    fn test_reader_yields_buffers() {
        let (sim, dev) = simulated();
        let mut reader = FobosReader::new(dev, 4, 1024);
        for _ in 0..3 {
            let chunk = reader.next().unwrap().unwrap();
            assert_eq!(chunk.len(), 1024);
        }

        let dev = reader.stop().unwrap();
        assert_eq!(dev.status(), AsyncStatus::Idle);
        assert_eq!(dev.allocated_buffers(), 0);
        assert!(!sim.is_streaming());
        assert!(dev.stream_stats().delivered >= 3);
    }

    #[test]
    fn test_dropping_reader_stops_stream() {
        let (sim, dev) = simulated();
        let mut reader = FobosReader::new(dev, 2, 256);
        reader.next().unwrap().unwrap();
        drop(reader);
        // the device was closed on drop
        assert!(sim.is_released());
    }

    #[test]
    fn test_lost_device_reaches_a_lagging_reader() {
        let sim = SimulatedTransport::new();
        let calibration = encode_square(128);
        let data = encode_square(128);
        for _ in 0..4 {
            sim.push_frame(BulkFrame::Data(calibration.clone()));
        }
        for _ in 0..40 {
            sim.push_frame(BulkFrame::Data(data.clone()));
        }
        sim.push_frame(BulkFrame::NoDevice);
        let dev = Fobos::with_transport(Box::new(sim));

        let mut reader = FobosReader::new(dev, 4, 128);
        // let the channel fill up while nobody reads
        std::thread::sleep(Duration::from_millis(500));

        let items: Vec<_> = reader.by_ref().collect();
        assert_eq!(items.len(), CHANNEL_DEPTH + 1);
        assert!(items[..CHANNEL_DEPTH].iter().all(|item| item.is_ok()));
        assert!(matches!(items.last(), Some(Err(Error::DeviceLost))));
        assert_eq!(reader.overruns(), 40 - CHANNEL_DEPTH as u64);
    }

    #[tokio::test]
    async fn test_async_reader() {
        let (_sim, dev) = simulated();
        let mut reader = AsyncFobosReader::new(dev, 4, 512);
        let chunk = reader.next().await.unwrap().unwrap();
        assert_eq!(chunk.len(), 512);

        let dev = tokio::task::spawn_blocking(move || reader.stop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dev.status(), AsyncStatus::Idle);
    }
}
