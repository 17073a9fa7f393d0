use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex,
    },
    thread,
    time::Duration,
};

use aulos_asset::{MediaAsset, SegmentRequest};
use aulos_buf::{ByteRingBuffer, WaitOutcome};
use aulos_core::StreamKind;
use aulos_mp4::{SampleInfo, Track};
use aulos_net::{ConnectionInfo, Net, NetError};
use bytes::Bytes;
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};
use url::Url;

use crate::{
    error::{StreamError, StreamResult},
    events::{StreamContext, StreamEvent},
    fetch::{FetchOptions, FetchRequest, FetchSession},
    sink::{AccessUnit, AccessUnitSink, SegmentOutcome, SegmentState, SinkError},
};

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Minimum ring buffer capacity; actual capacity is sized generously
    /// above the expected segment span.
    pub buffer_floor: usize,
    /// Physical read bound handed to the fetch session.
    pub chunk_size: u64,
    /// Bound on any single wait for sample bytes.
    pub read_timeout: Duration,
    /// Bounded backoff for sink backpressure.
    pub emit_retry_limit: u32,
    pub emit_retry_delay: Duration,
    pub fetch: FetchOptions,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            buffer_floor: 256 * 1024,
            chunk_size: 64 * 1024,
            read_timeout: Duration::from_secs(10),
            emit_retry_limit: 5,
            emit_retry_delay: Duration::from_millis(10),
            fetch: FetchOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Fetching,
    Demuxing,
    Completed,
    Failed,
    Cancelled,
}

enum Cmd {
    Run(Box<SegmentRequest>),
    Shutdown,
}

struct ActiveTransfer {
    session: Arc<FetchSession>,
    primary_kind: StreamKind,
}

struct Shared {
    state: Mutex<WorkerState>,
    active: Mutex<Option<ActiveTransfer>>,
    cancelled: AtomicBool,
    silent_cancel: AtomicBool,
}

/// Executes one [`SegmentRequest`] end to end on a dedicated worker thread:
/// opens a fetch session, drains the ring buffer through per-track demuxing,
/// emits access units downstream, and records download statistics.
///
/// At most one request is in flight; a second `add_request` while one is
/// active is rejected with [`StreamError::TryAgainLater`].
pub struct SegmentReaderWorker {
    shared: Arc<Shared>,
    tx: mpsc::Sender<Cmd>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SegmentReaderWorker {
    pub fn spawn(
        handle: Handle,
        net: Arc<dyn Net>,
        url: Url,
        asset: Arc<MediaAsset>,
        sink: Box<dyn AccessUnitSink>,
        ctx: StreamContext,
        options: WorkerOptions,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(WorkerState::Idle),
            active: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            silent_cancel: AtomicBool::new(false),
        });
        let (tx, rx) = mpsc::channel();

        let mut worker = WorkerLoop {
            handle,
            net,
            url,
            asset,
            sink,
            ctx,
            options,
            shared: Arc::clone(&shared),
        };
        let thread = thread::Builder::new()
            .name("aulos-segment-reader".into())
            .spawn(move || worker.run(rx))
            .expect("spawn segment reader thread");

        Self {
            shared,
            tx,
            thread: Some(thread),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.state.lock().expect("worker state lock")
    }

    /// Hand the worker its next segment.
    ///
    /// # Errors
    ///
    /// [`StreamError::TryAgainLater`] while a request is still active,
    /// [`StreamError::WorkerGone`] if the worker thread has shut down.
    pub fn add_request(&self, request: SegmentRequest) -> StreamResult<()> {
        {
            let mut state = self.shared.state.lock().expect("worker state lock");
            if matches!(*state, WorkerState::Fetching | WorkerState::Demuxing) {
                return Err(StreamError::TryAgainLater);
            }
            *state = WorkerState::Fetching;
        }
        self.shared.cancelled.store(false, Ordering::SeqCst);
        self.shared.silent_cancel.store(false, Ordering::SeqCst);

        self.tx
            .send(Cmd::Run(Box::new(request)))
            .map_err(|_| StreamError::WorkerGone)
    }

    /// Abort the active transfer, waking the demux loop immediately.
    ///
    /// With `kind` set, only cancels when it matches the active request's
    /// primary stream. `silent` suppresses the downstream error
    /// notification — scrubbing cancels are not network failures.
    pub fn cancel_request(&self, kind: Option<StreamKind>, silent: bool) {
        let active = self.shared.active.lock().expect("worker active lock");
        match active.as_ref() {
            Some(transfer) => {
                if kind.is_none_or(|k| k == transfer.primary_kind) {
                    self.shared.silent_cancel.store(silent, Ordering::SeqCst);
                    self.shared.cancelled.store(true, Ordering::SeqCst);
                    transfer.session.cancel();
                }
            }
            // The worker may not have opened its session yet; leave the
            // flags for it to observe right after it does.
            None if kind.is_none() => {
                self.shared.silent_cancel.store(silent, Ordering::SeqCst);
                self.shared.cancelled.store(true, Ordering::SeqCst);
            }
            None => {}
        }
    }
}

impl Drop for SegmentReaderWorker {
    fn drop(&mut self) {
        let _ = self.tx.send(Cmd::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct Front {
    track: Arc<Track>,
    next: Option<usize>,
    ended_notified: bool,
}

struct WorkerLoop {
    handle: Handle,
    net: Arc<dyn Net>,
    url: Url,
    asset: Arc<MediaAsset>,
    sink: Box<dyn AccessUnitSink>,
    ctx: StreamContext,
    options: WorkerOptions,
    shared: Arc<Shared>,
}

impl WorkerLoop {
    fn run(&mut self, rx: mpsc::Receiver<Cmd>) {
        while let Ok(cmd) = rx.recv() {
            match cmd {
                Cmd::Run(request) => self.execute(*request),
                Cmd::Shutdown => break,
            }
        }
        trace!("segment reader thread stopped");
    }

    fn execute(&mut self, mut request: SegmentRequest) {
        let result = self.run_segment(&mut request);

        let (state, error) = match result {
            Ok(()) => (SegmentState::Completed, None),
            Err(StreamError::Cancelled) => (SegmentState::Cancelled, None),
            Err(err) => (SegmentState::Failed, Some(err.to_string())),
        };

        *self.shared.active.lock().expect("worker active lock") = None;
        *self.shared.state.lock().expect("worker state lock") = match state {
            SegmentState::Completed => WorkerState::Completed,
            SegmentState::Failed => WorkerState::Failed,
            SegmentState::Cancelled => WorkerState::Cancelled,
        };

        let silent = self.shared.silent_cancel.load(Ordering::SeqCst);
        if let Some(detail) = &error {
            warn!(download_id = request.download_id, detail, "segment failed");
            if !silent {
                self.ctx.publish(StreamEvent::Error {
                    detail: detail.clone(),
                });
            }
        }

        self.ctx.publish(StreamEvent::SegmentDone {
            download_id: request.download_id,
            state,
            bytes: request
                .connection_info
                .as_ref()
                .map_or(0, |i| i.bytes_transferred),
            status: request.connection_info.as_ref().and_then(|i| i.status_code),
        });

        // Statistics reach the sink whatever the terminal state.
        self.sink.on_segment_done(SegmentOutcome {
            state,
            request,
            error,
        });
    }

    fn run_segment(&mut self, request: &mut SegmentRequest) -> StreamResult<()> {
        if request.all_tracks_ended {
            debug!(download_id = request.download_id, "all tracks at end; nothing to fetch");
            for id in request.selected_track_ids() {
                if let Some(track) = self.asset.track_by_id(id) {
                    self.sink.on_track_ended(track.id, track.kind);
                    self.ctx.publish(StreamEvent::TrackEnded { track_id: track.id });
                }
            }
            request.connection_info = Some(ConnectionInfo::default());
            return Ok(());
        }
        if request.insert_filler_data {
            let result = self.run_filler(request);
            request.connection_info = Some(ConnectionInfo::default());
            return result;
        }

        let mut fronts = self.build_fronts(request)?;

        let capacity = (request.bytes_in_segment as usize)
            .saturating_mul(2)
            .max(self.options.buffer_floor);
        let ring = ByteRingBuffer::new(capacity);

        let session = FetchSession::start(
            &self.handle,
            Arc::clone(&self.net),
            FetchRequest {
                url: self.url.clone(),
                range: Some(request.byte_range()),
                chunk_size: self.options.chunk_size,
                buffer: ring.clone(),
            },
            self.options.fetch.clone(),
        );
        *self.shared.active.lock().expect("worker active lock") = Some(ActiveTransfer {
            session: Arc::clone(&session),
            primary_kind: request.primary_kind,
        });
        // A cancel may have arrived before the session existed.
        if self.shared.cancelled.load(Ordering::SeqCst) {
            session.cancel();
        }

        debug!(
            download_id = request.download_id,
            start = request.start_offset,
            end = ?request.end_offset,
            capacity,
            "segment fetch started"
        );

        let result = self.demux_loop(request, &mut fronts, &ring, &session);

        // Whatever happened, resolve the transfer and attach its
        // statistics. A finished bounded span has already ended on its own;
        // an open span (or a failed demux) still needs its transfer stopped.
        if result.is_err() || request.end_offset.is_none() {
            session.cancel();
        }
        let info = session.wait(self.options.read_timeout).unwrap_or_else(|| {
            warn!(download_id = request.download_id, "transfer did not resolve in time");
            ConnectionInfo::default()
        });
        request.connection_info = Some(info);
        result
    }

    fn demux_loop(
        &mut self,
        request: &mut SegmentRequest,
        fronts: &mut [Front],
        ring: &ByteRingBuffer,
        session: &FetchSession,
    ) -> StreamResult<()> {
        let loop_base = request
            .loop_state
            .enabled
            .then_some(request.loop_state.base_time)
            .unwrap_or_default();
        let mut pos = request.start_offset;
        let mut demuxing = false;

        while let Some((front_idx, sample)) = next_sample(fronts, request.end_offset) {
            // Bytes between the previous sample and this one belong to no
            // selected track; drop them.
            let gap = sample.offset.saturating_sub(pos);
            if gap > 0 {
                self.consume_gap(ring, session, gap, pos)?;
            }

            let data = self.read_sample(ring, session, &sample)?;
            if !demuxing {
                demuxing = true;
                *self.shared.state.lock().expect("worker state lock") = WorkerState::Demuxing;
            }
            pos = sample.end_offset();

            let unit = AccessUnit {
                track_id: sample.track_id,
                kind: sample.kind,
                dts: loop_base + sample.dts,
                pts: loop_base + sample.pts,
                duration: sample.duration,
                is_sync: sample.is_sync,
                data: Bytes::from(data),
            };
            let end_ts = unit.dts + unit.duration;
            self.emit_with_backoff(unit)?;

            request.cursor_byte_pos = pos;
            if end_ts > request.largest_end_timestamp {
                request.largest_end_timestamp = end_ts;
            }
            self.ctx.publish(StreamEvent::DownloadProgress {
                download_id: request.download_id,
                offset: pos,
            });

            self.advance_front(fronts, front_idx);
        }
        Ok(())
    }

    /// A filler request downloads and emits nothing; it advances the time
    /// and byte bookkeeping from the sample tables alone, and the sink fills
    /// the gap with silence or a frozen frame.
    fn run_filler(&mut self, request: &mut SegmentRequest) -> StreamResult<()> {
        debug!(download_id = request.download_id, "filling segment without media");
        let mut fronts = self.build_fronts(request)?;
        let loop_base = request
            .loop_state
            .enabled
            .then_some(request.loop_state.base_time)
            .unwrap_or_default();

        while let Some((front_idx, sample)) = next_sample(&fronts, request.end_offset) {
            request.cursor_byte_pos = sample.end_offset();
            let end_ts = loop_base + sample.dts + sample.duration;
            if end_ts > request.largest_end_timestamp {
                request.largest_end_timestamp = end_ts;
            }
            self.advance_front(&mut fronts, front_idx);
        }
        Ok(())
    }

    fn build_fronts(&self, request: &SegmentRequest) -> StreamResult<Vec<Front>> {
        request
            .selected_track_ids()
            .into_iter()
            .map(|id| {
                let track = self
                    .asset
                    .track_by_id(id)
                    .ok_or(StreamError::UnknownTrack(id))?;
                Ok(Front {
                    track: Arc::clone(track),
                    next: track.samples.first_offset_at_or_after(request.start_offset),
                    ended_notified: false,
                })
            })
            .collect()
    }

    fn advance_front(&mut self, fronts: &mut [Front], idx: usize) {
        let front = &mut fronts[idx];
        front.next = front
            .next
            .map(|i| i + 1)
            .filter(|&i| i < front.track.samples.len());

        // True end of stream for this track, independent of the segment
        // boundary: report it so the sink can finalize the track.
        if front.next.is_none() && !front.ended_notified {
            front.ended_notified = true;
            self.sink.on_track_ended(front.track.id, front.track.kind);
            self.ctx.publish(StreamEvent::TrackEnded {
                track_id: front.track.id,
            });
        }
    }

    fn consume_gap(
        &self,
        ring: &ByteRingBuffer,
        session: &FetchSession,
        mut gap: u64,
        offset: u64,
    ) -> StreamResult<()> {
        while gap > 0 {
            match ring.wait_for_size(1, self.options.read_timeout) {
                WaitOutcome::Ready => {
                    let want = gap.min(usize::MAX as u64) as usize;
                    gap -= ring.skip(want) as u64;
                }
                WaitOutcome::EndOfData => {
                    return Err(StreamError::TruncatedSample {
                        missing: gap as usize,
                    })
                }
                WaitOutcome::Aborted => return Err(self.abort_reason(session)),
                WaitOutcome::TimedOut => {
                    return Err(StreamError::StarvedBuffer {
                        offset,
                        wanted: gap as usize,
                    })
                }
            }
        }
        Ok(())
    }

    fn read_sample(
        &self,
        ring: &ByteRingBuffer,
        session: &FetchSession,
        sample: &SampleInfo,
    ) -> StreamResult<Vec<u8>> {
        let size = sample.size as usize;
        let mut data = vec![0u8; size];
        let mut got = 0;

        while got < size {
            match ring.wait_for_size(1, self.options.read_timeout) {
                WaitOutcome::Ready => got += ring.pop_into(&mut data[got..]),
                WaitOutcome::EndOfData => {
                    // wait_for_size(1) only reports EndOfData on a drained
                    // buffer, so the stream is short of a whole sample.
                    return Err(StreamError::TruncatedSample {
                        missing: size - got,
                    });
                }
                WaitOutcome::Aborted => return Err(self.abort_reason(session)),
                WaitOutcome::TimedOut => {
                    return Err(StreamError::StarvedBuffer {
                        offset: sample.offset + got as u64,
                        wanted: size - got,
                    })
                }
            }
        }
        trace!(
            track = sample.track_id,
            offset = sample.offset,
            size,
            "sample demuxed"
        );
        Ok(data)
    }

    /// An aborted ring means either our own cancellation or a failed
    /// transfer; the session's statistics tell which.
    fn abort_reason(&self, session: &FetchSession) -> StreamError {
        if self.shared.cancelled.load(Ordering::SeqCst) {
            return StreamError::Cancelled;
        }
        match session.wait(Duration::from_secs(1)) {
            Some(info) => match info.error {
                Some(detail) => StreamError::Net(NetError::Transport(detail)),
                None => StreamError::Cancelled,
            },
            None => StreamError::Net(NetError::Transport(
                "transfer aborted without statistics".into(),
            )),
        }
    }

    fn emit_with_backoff(&mut self, unit: AccessUnit) -> StreamResult<()> {
        let mut attempt = 0;
        loop {
            match self.sink.on_access_unit(unit.clone()) {
                Ok(()) => return Ok(()),
                Err(SinkError::Backpressure) if attempt < self.options.emit_retry_limit => {
                    attempt += 1;
                    trace!(attempt, "sink backpressure; backing off");
                    thread::sleep(self.options.emit_retry_delay);
                }
                Err(SinkError::Backpressure) => {
                    return Err(StreamError::Sink(format!(
                        "backpressure persisted through {attempt} retries"
                    )))
                }
                Err(SinkError::Fatal(detail)) => return Err(StreamError::Sink(detail)),
            }
        }
    }
}

/// The front sample with the smallest file offset, bounded by the segment
/// end.
fn next_sample(fronts: &[Front], end_offset: Option<u64>) -> Option<(usize, SampleInfo)> {
    fronts
        .iter()
        .enumerate()
        .filter_map(|(idx, f)| {
            let sample = f.next.and_then(|i| f.track.sample(i))?;
            match end_offset {
                Some(end) if sample.offset > end => None,
                _ => Some((idx, sample)),
            }
        })
        .min_by_key(|(_, s)| s.offset)
}
