use std::{
    sync::{mpsc, Arc, Mutex},
    time::{Duration, Instant},
};

use aulos_buf::ByteRingBuffer;
use aulos_net::{ConnectionInfo, Headers, Net, NetError, RangeSpec};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

/// One asynchronous, cancellable, range-restricted transfer feeding a ring
/// buffer.
pub struct FetchRequest {
    pub url: Url,
    /// Byte range to fetch; `None` streams the whole resource.
    pub range: Option<RangeSpec>,
    /// Upper bound on any single physical range request. Purely a latency
    /// knob; invisible to the ring buffer consumer.
    pub chunk_size: u64,
    pub buffer: ByteRingBuffer,
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub headers: Option<Headers>,
    /// How long to sleep when the ring buffer has no room.
    pub room_poll_interval: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            headers: None,
            room_poll_interval: Duration::from_millis(2),
        }
    }
}

/// Handle to a running transfer.
///
/// The transfer runs as a tokio task; completion is observed with the
/// blocking [`wait`](Self::wait) from the demux side. `cancel` is
/// cooperative: the task notices the token at its next suspension point and
/// finishes without a spurious error status.
pub struct FetchSession {
    cancel: CancellationToken,
    buffer: ByteRingBuffer,
    rx: Mutex<mpsc::Receiver<ConnectionInfo>>,
    finished: Mutex<Option<ConnectionInfo>>,
}

impl FetchSession {
    /// Spawn the transfer on `handle`'s runtime.
    pub fn start<N>(
        handle: &tokio::runtime::Handle,
        net: Arc<N>,
        request: FetchRequest,
        options: FetchOptions,
    ) -> Arc<Self>
    where
        N: Net + ?Sized + 'static,
    {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel();

        let session = Arc::new(Self {
            cancel: cancel.clone(),
            buffer: request.buffer.clone(),
            rx: Mutex::new(rx),
            finished: Mutex::new(None),
        });

        handle.spawn(run_transfer(net, request, options, cancel, tx));
        session
    }

    /// Request cooperative termination and wake the consumer.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.buffer.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Block until the transfer finishes, bounded by `timeout`.
    pub fn wait(&self, timeout: Duration) -> Option<ConnectionInfo> {
        if let Some(info) = self.finished.lock().expect("fetch session lock").clone() {
            return Some(info);
        }
        let rx = self.rx.lock().expect("fetch session lock");
        match rx.recv_timeout(timeout) {
            Ok(info) => {
                *self.finished.lock().expect("fetch session lock") = Some(info.clone());
                Some(info)
            }
            Err(_) => None,
        }
    }
}

enum TransferEnd {
    Cancelled,
    Net(NetError),
}

async fn run_transfer<N: Net + ?Sized>(
    net: Arc<N>,
    request: FetchRequest,
    options: FetchOptions,
    cancel: CancellationToken,
    tx: mpsc::Sender<ConnectionInfo>,
) {
    let started = Instant::now();
    let mut info = ConnectionInfo::default();

    let outcome = transfer_loop(&*net, &request, &options, &cancel, started, &mut info).await;
    info.total_time = started.elapsed();

    match outcome {
        Ok(()) => {
            trace!(bytes = info.bytes_transferred, "transfer complete");
            request.buffer.signal_end_of_data();
        }
        Err(TransferEnd::Cancelled) => {
            // The ring buffer was already aborted by `cancel()`; a cancelled
            // transfer carries no error status.
            debug!(bytes = info.bytes_transferred, "transfer cancelled");
        }
        Err(TransferEnd::Net(err)) => {
            debug!(%err, "transfer failed");
            if info.status_code.is_none() {
                info.status_code = err.status_code();
            }
            info.error = Some(err.to_string());
            request.buffer.abort();
        }
    }

    let _ = tx.send(info);
}

async fn transfer_loop<N: Net + ?Sized>(
    net: &N,
    request: &FetchRequest,
    options: &FetchOptions,
    cancel: &CancellationToken,
    started: Instant,
    info: &mut ConnectionInfo,
) -> Result<(), TransferEnd> {
    let start = request.range.map_or(0, |r| r.start);
    let end = request.range.and_then(|r| r.end);
    let chunk = request.chunk_size.max(1);
    let mut next = start;

    loop {
        if cancel.is_cancelled() {
            return Err(TransferEnd::Cancelled);
        }
        if let Some(end) = end {
            if next > end {
                return Ok(());
            }
        }

        // Bounded spans are fetched in sub-ranges of at most `chunk` bytes;
        // an open span is one streaming request.
        let sub = match end {
            Some(end) => RangeSpec::new(next, Some(end.min(next + chunk - 1))),
            None => RangeSpec::from_start(next),
        };

        let resp = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(TransferEnd::Cancelled),
            r = net.get_range(request.url.clone(), sub, options.headers.clone()) => {
                r.map_err(TransferEnd::Net)?
            }
        };
        if info.status_code.is_none() {
            info.status_code = Some(resp.status);
            info.redirect_count = u32::from(resp.redirected);
        }

        let mut stream = resp.stream;
        let mut received_this_request = 0u64;
        loop {
            let item = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(TransferEnd::Cancelled),
                item = stream.next() => item,
            };
            let Some(item) = item else { break };
            let bytes = item.map_err(TransferEnd::Net)?;
            if bytes.is_empty() {
                continue;
            }

            if info.time_to_first_byte.is_none() {
                info.time_to_first_byte = Some(started.elapsed());
            }

            push_all(&request.buffer, &bytes, cancel, options.room_poll_interval).await?;
            received_this_request += bytes.len() as u64;
            info.bytes_transferred += bytes.len() as u64;
            next += bytes.len() as u64;
        }

        match end {
            // Open span: the server closed the stream, we are done.
            None => return Ok(()),
            Some(end) if next > end => return Ok(()),
            Some(_) if received_this_request == 0 => {
                // The resource ended short of the requested span; do not
                // spin re-requesting an empty range.
                return Ok(());
            }
            // Short response; re-request the remainder from where it broke.
            Some(_) => {}
        }
    }
}

/// Push a network chunk into the ring, polling for room.
async fn push_all(
    ring: &ByteRingBuffer,
    mut data: &[u8],
    cancel: &CancellationToken,
    poll: Duration,
) -> Result<(), TransferEnd> {
    while !data.is_empty() {
        if cancel.is_cancelled() || ring.is_aborted() {
            return Err(TransferEnd::Cancelled);
        }

        let n = ring.free().min(data.len());
        if n == 0 {
            tokio::time::sleep(poll).await;
            continue;
        }

        let (head, rest) = data.split_at(n);
        let pushed = ring.push_with(n, |a, b| {
            let first = a.len().min(head.len());
            a[..first].copy_from_slice(&head[..first]);
            b[..head.len() - first].copy_from_slice(&head[first..]);
            head.len()
        });
        if pushed {
            data = rest;
        } else {
            // Raced with a concurrent state change; re-evaluate.
            tokio::time::sleep(poll).await;
        }
    }
    Ok(())
}
