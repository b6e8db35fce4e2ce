//! Single-writer append actors.
//!
//! Store append primitives are not safe for several simultaneous writers, so
//! each target table gets one owned writer thread fed by a bounded queue.
//! Rows are batched; a flush request travels through the same queue, so once
//! [`Appender::flush`] returns every row queued before it has reached the
//! sink. A ticker flushes periodically even when nobody asks.

use crate::error::{LogheapError, Result};
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

enum Command<T> {
    Row(T),
    Flush(Sender<Result<()>>),
}

/// Handle to a writer thread appending rows of type `T`.
pub struct Appender<T: Send + 'static> {
    name: String,
    tx: Option<Sender<Command<T>>>,
    handle: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Appender<T> {
    /// Start a writer thread.
    ///
    /// `capacity` bounds both the queue and the batch handed to `sink`.
    pub fn spawn<F>(
        name: impl Into<String>,
        capacity: usize,
        flush_every: Duration,
        sink: F,
    ) -> Result<Self>
    where
        F: FnMut(Vec<T>) -> Result<()> + Send + 'static,
    {
        let name = name.into();
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        let ticker = tick(flush_every);
        let thread_name = name.clone();

        let handle = thread::Builder::new()
            .name(format!("logheap-{name}"))
            .spawn(move || run_writer(thread_name, rx, ticker, capacity, sink))?;

        Ok(Appender {
            name,
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    fn sender(&self) -> Result<&Sender<Command<T>>> {
        self.tx.as_ref().ok_or_else(|| self.closed())
    }

    fn closed(&self) -> LogheapError {
        LogheapError::WriterClosed {
            name: self.name.clone(),
        }
    }

    /// Queue a row. Blocks while the queue is full.
    pub fn append(&self, row: T) -> Result<()> {
        self.sender()?
            .send(Command::Row(row))
            .map_err(|_| self.closed())
    }

    /// Wait until every previously queued row has been written.
    ///
    /// Reports a sink failure that happened since the last flush.
    pub fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = bounded(1);
        self.sender()?
            .send(Command::Flush(ack_tx))
            .map_err(|_| self.closed())?;
        ack_rx.recv().map_err(|_| self.closed())?
    }

    /// Flush, stop the thread and wait for it.
    pub fn close(mut self) -> Result<()> {
        let flushed = self.flush();
        self.shutdown();
        flushed
    }

    fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(writer = %self.name, "writer thread panicked");
            }
        }
    }
}

impl<T: Send + 'static> Drop for Appender<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_writer<T, F>(
    name: String,
    rx: Receiver<Command<T>>,
    ticker: Receiver<std::time::Instant>,
    max_batch: usize,
    mut sink: F,
) where
    F: FnMut(Vec<T>) -> Result<()>,
{
    let mut batch: Vec<T> = Vec::with_capacity(max_batch);
    let mut failure: Option<String> = None;

    let mut write = |batch: &mut Vec<T>, failure: &mut Option<String>| {
        if batch.is_empty() {
            return;
        }
        let rows = std::mem::replace(batch, Vec::with_capacity(max_batch));
        let count = rows.len();
        if let Err(e) = sink(rows) {
            warn!(writer = %name, rows = count, error = %e, "append failed");
            failure.get_or_insert_with(|| e.to_string());
        }
    };

    loop {
        select! {
            recv(rx) -> msg => match msg {
                Ok(Command::Row(row)) => {
                    batch.push(row);
                    if batch.len() >= max_batch {
                        write(&mut batch, &mut failure);
                    }
                }
                Ok(Command::Flush(ack)) => {
                    write(&mut batch, &mut failure);
                    let result = match failure.take() {
                        Some(reason) => Err(LogheapError::WriterFailed {
                            name: name.clone(),
                            reason,
                        }),
                        None => Ok(()),
                    };
                    let _ = ack.send(result);
                }
                Err(_) => {
                    write(&mut batch, &mut failure);
                    break;
                }
            },
            recv(ticker) -> _ => write(&mut batch, &mut failure),
        }
    }

    debug!(writer = %name, "writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn collecting(capacity: usize) -> (Appender<u32>, Arc<Mutex<Vec<u32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let appender = Appender::spawn("test", capacity, Duration::from_secs(3600), move |rows| {
            sink_seen.lock().extend(rows);
            Ok(())
        })
        .unwrap();
        (appender, seen)
    }

    #[test]
    fn test_flush_is_a_barrier() {
        let (appender, seen) = collecting(100);
        for i in 0..10 {
            appender.append(i).unwrap();
        }
        appender.flush().unwrap();
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_batches_flow_without_flush() {
        let (appender, seen) = collecting(4);
        for i in 0..8 {
            appender.append(i).unwrap();
        }
        // Two full batches are written without an explicit flush
        appender.close().unwrap();
        assert_eq!(seen.lock().len(), 8);
    }

    #[test]
    fn test_periodic_flush() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let appender = Appender::spawn("tick", 100, Duration::from_millis(10), move |rows: Vec<u32>| {
            sink_seen.lock().extend(rows);
            Ok(())
        })
        .unwrap();
        appender.append(7).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while seen.lock().is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*seen.lock(), vec![7]);
    }

    #[test]
    fn test_sink_failure_reported_on_flush() {
        let appender = Appender::spawn("failing", 10, Duration::from_secs(3600), |_rows: Vec<u32>| {
            Err(LogheapError::Internal("disk full".to_string()))
        })
        .unwrap();
        appender.append(1).unwrap();
        let err = appender.flush().unwrap_err();
        assert!(matches!(err, LogheapError::WriterFailed { .. }));
        // The failure is reported once
        appender.flush().unwrap();
    }
}
