//! End-to-end pipeline tests: a synthetic two-track progressive MP4 served
//! over HTTP, scanned by the playlist worker and streamed segment by
//! segment through the reader worker.

use std::{
    sync::{mpsc, Arc, Mutex},
    time::Duration,
};

use aulos_asset::{AssetError, AssetOptions, MediaAsset, SegmentSource};
use aulos_core::StreamKind;
use aulos_mp4::{
    fixture::{FixtureSample, FixtureTrack, MuxedContainer},
    SearchMode,
};
use aulos_net::{HttpClient, Net, NetOptions};
use aulos_stream::{
    AccessUnit, AccessUnitSink, PlaylistOptions, PlaylistWorker, SegmentOutcome, SegmentState,
    SegmentReaderWorker, SinkError, StreamContext, StreamError, WorkerOptions,
};
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use url::Url;

// ---------------------------------------------------------------------------
// HTTP fixture server
// ---------------------------------------------------------------------------

struct TestServer {
    base_url: Url,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    async fn new(router: Router) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let server = axum::serve(listener, router).with_graceful_shutdown(async {
            shutdown_rx.await.ok();
        });
        tokio::spawn(async move {
            server.await.unwrap();
        });

        Self {
            base_url: Url::parse(&format!("http://{addr}")).unwrap(),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    fn url(&self, path: &str) -> Url {
        self.base_url.join(path).unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn parse_range(headers: &HeaderMap, len: usize) -> Option<(usize, usize)> {
    let value = headers.get(header::RANGE)?.to_str().ok()?;
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end = if end.is_empty() {
        len
    } else {
        (end.parse::<usize>().ok()? + 1).min(len)
    };
    Some((start.min(len), end))
}

async fn media_handler(
    State(body): State<Arc<Vec<u8>>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    match parse_range(&headers, body.len()) {
        Some((start, end)) => (StatusCode::PARTIAL_CONTENT, body[start..end].to_vec()),
        None => (StatusCode::OK, body.as_ref().clone()),
    }
}

async fn stalling_handler() -> impl IntoResponse {
    let stream = futures::stream::pending::<Result<Vec<u8>, std::io::Error>>();
    (StatusCode::OK, Body::from_stream(stream))
}

fn media_router(bytes: Vec<u8>) -> Router {
    Router::new()
        .route("/movie.mp4", get(media_handler).with_state(Arc::new(bytes)))
        .route("/stalled.mp4", get(stalling_handler))
}

// ---------------------------------------------------------------------------
// Collecting sink
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SinkState {
    units: Vec<AccessUnit>,
    ended_tracks: Vec<u32>,
}

struct CollectingSink {
    state: Arc<Mutex<SinkState>>,
    done_tx: mpsc::Sender<SegmentOutcome>,
}

impl CollectingSink {
    fn new() -> (Self, Arc<Mutex<SinkState>>, mpsc::Receiver<SegmentOutcome>) {
        let state = Arc::new(Mutex::new(SinkState::default()));
        let (done_tx, done_rx) = mpsc::channel();
        (
            Self {
                state: Arc::clone(&state),
                done_tx,
            },
            state,
            done_rx,
        )
    }
}

impl AccessUnitSink for CollectingSink {
    fn on_access_unit(&mut self, unit: AccessUnit) -> Result<(), SinkError> {
        self.state.lock().unwrap().units.push(unit);
        Ok(())
    }

    fn on_track_ended(&mut self, track_id: u32, _kind: StreamKind) {
        self.state.lock().unwrap().ended_tracks.push(track_id);
    }

    fn on_segment_done(&mut self, outcome: SegmentOutcome) {
        let _ = self.done_tx.send(outcome);
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Video 1s at 4 samples + audio 1s at 8 samples, interleaved.
fn two_track_container() -> MuxedContainer {
    let video = FixtureTrack::new(1, StreamKind::Video, 1000, *b"avc1")
        .sample(FixtureSample::new(250, 400).sync())
        .sample(FixtureSample::new(250, 400))
        .sample(FixtureSample::new(250, 400))
        .sample(FixtureSample::new(250, 400).sync());
    let audio = FixtureTrack::new(2, StreamKind::Audio, 48_000, *b"mp4a")
        .language("eng")
        .with_uniform_samples(8, 6000, 100);
    MuxedContainer::build(&[video, audio])
}

async fn load_asset(
    server: &TestServer,
    ctx: StreamContext,
    asset_options: AssetOptions,
) -> Arc<MediaAsset> {
    let net: Arc<dyn Net> = Arc::new(HttpClient::new(NetOptions::default()));
    let worker = PlaylistWorker::new(
        tokio::runtime::Handle::current(),
        net,
        ctx,
        PlaylistOptions {
            asset: asset_options,
            ..PlaylistOptions::default()
        },
    );
    let url = server.url("/movie.mp4");
    tokio::task::spawn_blocking(move || worker.load(url))
        .await
        .unwrap()
        .unwrap()
}

fn reader_worker(
    server: &TestServer,
    asset: Arc<MediaAsset>,
    ctx: StreamContext,
    sink: CollectingSink,
) -> SegmentReaderWorker {
    let net: Arc<dyn Net> = Arc::new(HttpClient::new(NetOptions::default()));
    SegmentReaderWorker::spawn(
        tokio::runtime::Handle::current(),
        net,
        server.url("/movie.mp4"),
        asset,
        Box::new(sink),
        ctx,
        WorkerOptions::default(),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn playlist_worker_builds_asset_from_http() {
    let muxed = two_track_container();
    let server = TestServer::new(media_router(muxed.bytes.clone())).await;
    let ctx = StreamContext::default();
    let mut events = ctx.subscribe();

    let asset = load_asset(&server, ctx, AssetOptions::default()).await;

    let tracks = asset.tracks();
    assert_eq!(tracks.len(), 2);
    assert_eq!(tracks[0].kind, StreamKind::Video);
    assert_eq!(tracks[1].kind, StreamKind::Audio);
    assert_eq!(tracks[1].language, "eng");
    assert_eq!(asset.get_total_duration(), Duration::from_secs(1));

    let event = events.try_recv().expect("metadata event published");
    assert!(matches!(
        event,
        aulos_stream::StreamEvent::MetadataReady { track_count: 2, .. }
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn full_pipeline_delivers_every_sample_in_offset_order() {
    let muxed = two_track_container();
    let server = TestServer::new(media_router(muxed.bytes.clone())).await;
    let ctx = StreamContext::default();

    let asset = load_asset(&server, ctx.clone(), AssetOptions::default()).await;
    let (sink, state, done_rx) = CollectingSink::new();
    let worker = reader_worker(&server, Arc::clone(&asset), ctx, sink);

    let request = asset
        .get_starting_segment(Duration::ZERO, SearchMode::Before)
        .unwrap();
    assert_eq!(request.primary_kind, StreamKind::Video);
    assert_eq!(request.dependent_track_ids, vec![2]);
    worker.add_request(request).unwrap();

    let outcome = done_rx.recv_timeout(Duration::from_secs(30)).unwrap();
    assert_eq!(outcome.state, SegmentState::Completed);

    let info = outcome.request.connection_info.expect("statistics recorded");
    assert!(info.error.is_none());
    assert!(info.bytes_transferred > 0);

    let state = state.lock().unwrap();
    // 4 video + 8 audio samples, every payload byte intact.
    assert_eq!(state.units.len(), 12);
    for unit in &state.units {
        let expected: Vec<&[u8]> = (0..)
            .map_while(|i| {
                (i < if unit.track_id == 1 { 4 } else { 8 })
                    .then(|| muxed.sample_payload(unit.track_id, i))
            })
            .collect();
        assert!(expected.contains(&unit.data.as_ref()));
    }
    // Both tracks were demuxed to their true end of stream.
    let mut ended = state.ended_tracks.clone();
    ended.sort_unstable();
    assert_eq!(ended, vec![1, 2]);

    // Units arrive in non-decreasing dts order per track.
    for id in [1u32, 2] {
        let dts: Vec<Duration> = state
            .units
            .iter()
            .filter(|u| u.track_id == id)
            .map(|u| u.dts)
            .collect();
        assert!(dts.windows(2).all(|w| w[0] <= w[1]));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn capped_segments_stream_back_to_back_without_gap() {
    let muxed = two_track_container();
    let server = TestServer::new(media_router(muxed.bytes.clone())).await;
    let ctx = StreamContext::default();

    // Small cap: the 2400 bytes of media split across several segments.
    let asset = load_asset(
        &server,
        ctx.clone(),
        AssetOptions {
            max_segment_size: 700,
            ..AssetOptions::default()
        },
    )
    .await;
    let (sink, state, done_rx) = CollectingSink::new();
    let worker = reader_worker(&server, Arc::clone(&asset), ctx, sink);

    let mut segments = Vec::new();
    let mut current = asset
        .get_starting_segment(Duration::ZERO, SearchMode::Before)
        .unwrap();
    loop {
        worker.add_request(current.clone()).unwrap();
        let outcome = done_rx.recv_timeout(Duration::from_secs(30)).unwrap();
        assert_eq!(outcome.state, SegmentState::Completed);
        segments.push(outcome.request.clone());

        match asset.get_next_segment(&outcome.request) {
            Ok(next) => current = next,
            Err(AssetError::PastEnd) => break,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert!(segments.len() > 1, "cap must split the stream");
    for pair in segments.windows(2) {
        let end = pair[0].end_offset.expect("bounded segment");
        assert_eq!(pair[1].start_offset, end + 1, "no gap, no overlap");
    }
    assert_eq!(segments.last().unwrap().end_offset, None);

    // Every sample arrived exactly once.
    let state = state.lock().unwrap();
    assert_eq!(state.units.len(), 12);
    let video_bytes: usize = state
        .units
        .iter()
        .filter(|u| u.track_id == 1)
        .map(|u| u.data.len())
        .sum();
    assert_eq!(video_bytes, 4 * 400);
}

#[tokio::test(flavor = "multi_thread")]
async fn second_request_while_active_is_rejected() {
    let muxed = two_track_container();
    let server = TestServer::new(media_router(muxed.bytes.clone())).await;
    let ctx = StreamContext::default();

    let asset = load_asset(&server, ctx.clone(), AssetOptions::default()).await;
    let (sink, _state, done_rx) = CollectingSink::new();

    // Point the reader at a URL that stalls forever.
    let net: Arc<dyn Net> = Arc::new(HttpClient::new(NetOptions::default()));
    let worker = SegmentReaderWorker::spawn(
        tokio::runtime::Handle::current(),
        net,
        server.url("/stalled.mp4"),
        Arc::clone(&asset),
        Box::new(sink),
        ctx.clone(),
        WorkerOptions::default(),
    );

    let request = asset
        .get_starting_segment(Duration::ZERO, SearchMode::Before)
        .unwrap();
    worker.add_request(request.clone()).unwrap();

    // The single-outstanding-request invariant rejects a second request.
    let err = worker.add_request(request).unwrap_err();
    assert!(matches!(err, StreamError::TryAgainLater));

    // A silent cancel resolves the stalled segment without an error event.
    let mut events = ctx.subscribe();
    worker.cancel_request(None, true);
    let outcome = done_rx.recv_timeout(Duration::from_secs(30)).unwrap();
    assert_eq!(outcome.state, SegmentState::Cancelled);
    assert!(outcome.error.is_none());
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, aulos_stream::StreamEvent::Error { .. }),
            "silent cancel must not publish an error"
        );
    }

    // The worker is reusable afterwards.
    assert!(matches!(
        worker.state(),
        aulos_stream::WorkerState::Cancelled
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_resource_fails_the_segment_with_statistics() {
    let muxed = two_track_container();
    let server = TestServer::new(media_router(muxed.bytes.clone())).await;
    let ctx = StreamContext::default();

    let asset = load_asset(&server, ctx.clone(), AssetOptions::default()).await;
    let (sink, _state, done_rx) = CollectingSink::new();

    let net: Arc<dyn Net> = Arc::new(HttpClient::new(NetOptions::default()));
    let worker = SegmentReaderWorker::spawn(
        tokio::runtime::Handle::current(),
        net,
        server.url("/gone.mp4"),
        Arc::clone(&asset),
        Box::new(sink),
        ctx,
        WorkerOptions::default(),
    );

    let request = asset
        .get_starting_segment(Duration::ZERO, SearchMode::Before)
        .unwrap();
    worker.add_request(request).unwrap();

    let outcome = done_rx.recv_timeout(Duration::from_secs(30)).unwrap();
    assert_eq!(outcome.state, SegmentState::Failed);
    assert!(outcome.error.is_some());

    // Failure still carries the accumulated statistics.
    let info = outcome.request.connection_info.as_ref().expect("statistics recorded");
    assert!(info.error.is_some());

    // The scheduler can derive a retry that resumes from the last good
    // position (nothing was demuxed, so that is the original start).
    let retry = asset.get_retry_segment(&outcome.request, false).unwrap();
    assert_eq!(retry.start_offset, outcome.request.start_offset);
    assert_eq!(retry.retry_count, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn all_tracks_ended_request_completes_without_network() {
    let muxed = two_track_container();
    let server = TestServer::new(media_router(muxed.bytes.clone())).await;
    let ctx = StreamContext::default();

    let asset = load_asset(&server, ctx.clone(), AssetOptions::default()).await;
    let (sink, state, done_rx) = CollectingSink::new();
    // No server route needed: the request must not touch the network.
    let net: Arc<dyn Net> = Arc::new(HttpClient::new(NetOptions::default()));
    let worker = SegmentReaderWorker::spawn(
        tokio::runtime::Handle::current(),
        net,
        server.url("/gone.mp4"),
        Arc::clone(&asset),
        Box::new(sink),
        ctx,
        WorkerOptions::default(),
    );

    let request = asset
        .get_starting_segment(Duration::from_secs(5), SearchMode::After)
        .unwrap();
    assert!(request.all_tracks_ended);

    worker.add_request(request).unwrap();
    let outcome = done_rx.recv_timeout(Duration::from_secs(30)).unwrap();
    assert_eq!(outcome.state, SegmentState::Completed);
    assert!(state.lock().unwrap().units.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn looping_restarts_playback_with_shifted_timestamps() {
    let muxed = two_track_container();
    let server = TestServer::new(media_router(muxed.bytes.clone())).await;
    let ctx = StreamContext::default();

    let asset = load_asset(&server, ctx.clone(), AssetOptions::default()).await;
    let (sink, state, done_rx) = CollectingSink::new();
    let worker = reader_worker(&server, Arc::clone(&asset), ctx, sink);

    let first = asset
        .get_starting_segment(Duration::ZERO, SearchMode::Before)
        .unwrap();
    worker.add_request(first).unwrap();
    let finished = done_rx.recv_timeout(Duration::from_secs(30)).unwrap();
    assert_eq!(finished.state, SegmentState::Completed);
    assert_eq!(
        finished.request.largest_end_timestamp,
        Duration::from_secs(1)
    );

    let looped = asset
        .get_looping_segment(
            std::slice::from_ref(&finished.request),
            Duration::ZERO,
            SearchMode::Before,
        )
        .unwrap();
    assert_eq!(looped.loop_state.loop_count, 1);
    assert_eq!(looped.loop_state.base_time, Duration::from_secs(1));

    state.lock().unwrap().units.clear();
    worker.add_request(looped).unwrap();
    let second = done_rx.recv_timeout(Duration::from_secs(30)).unwrap();
    assert_eq!(second.state, SegmentState::Completed);

    // Timestamps of the second iteration continue past the first.
    let state = state.lock().unwrap();
    assert!(state
        .units
        .iter()
        .all(|u| u.dts >= Duration::from_secs(1)));
    assert_eq!(
        second.request.largest_end_timestamp,
        Duration::from_secs(2)
    );
}
