use std::{sync::Arc, time::Duration};

use aulos_asset::{AssetOptions, MediaAsset, SegmentSource};
use aulos_buf::ByteRingBuffer;
use aulos_mp4::{
    parse_moov, BoxScanner, BoxSize, FourCc, MetadataSink, Mp4Error, Mp4Result, ScanControl,
    Track,
};
use aulos_net::Net;
use tokio::runtime::Handle;
use tracing::debug;
use url::Url;

use crate::{
    error::{StreamError, StreamResult},
    events::{StreamContext, StreamEvent},
    fetch::{FetchOptions, FetchRequest, FetchSession},
    ring_reader::RingScanReader,
};

#[derive(Debug, Clone)]
pub struct PlaylistOptions {
    /// Initial ring capacity for the metadata probe.
    pub probe_capacity: usize,
    /// Physical read bound for the probe transfer. Deliberately small:
    /// metadata is expected to be tiny relative to the file.
    pub chunk_size: u64,
    pub read_timeout: Duration,
    pub asset: AssetOptions,
    pub fetch: FetchOptions,
}

impl Default for PlaylistOptions {
    fn default() -> Self {
        Self {
            probe_capacity: 512 * 1024,
            chunk_size: 16 * 1024,
            read_timeout: Duration::from_secs(10),
            asset: AssetOptions::default(),
            fetch: FetchOptions::default(),
        }
    }
}

/// Downloads the leading metadata region of a progressive file and builds
/// the [`MediaAsset`].
///
/// One pass: a fetch session streams the file head into a ring buffer, a
/// box scanner pull-parses it as bytes arrive, and the `moov` payload is
/// handed to the metadata parser. The probe ring buffer is discarded
/// afterwards; segment streaming always allocates its own.
pub struct PlaylistWorker {
    handle: Handle,
    net: Arc<dyn Net>,
    ctx: StreamContext,
    options: PlaylistOptions,
}

#[derive(Default)]
struct MoovCollector {
    tracks: Option<Vec<Track>>,
}

impl MetadataSink for MoovCollector {
    fn on_metadata_box(&mut self, box_type: FourCc, payload: &[u8]) -> Mp4Result<()> {
        if box_type == FourCc::MOOV {
            self.tracks = Some(parse_moov(payload)?);
        }
        Ok(())
    }
}

impl PlaylistWorker {
    pub fn new(
        handle: Handle,
        net: Arc<dyn Net>,
        ctx: StreamContext,
        options: PlaylistOptions,
    ) -> Self {
        Self {
            handle,
            net,
            ctx,
            options,
        }
    }

    /// Blocking: drive the metadata scan to completion and build the asset.
    pub fn load(&self, url: Url) -> StreamResult<Arc<MediaAsset>> {
        let ring = ByteRingBuffer::new(self.options.probe_capacity);
        let session = FetchSession::start(
            &self.handle,
            Arc::clone(&self.net),
            FetchRequest {
                url: url.clone(),
                range: None,
                chunk_size: self.options.chunk_size,
                buffer: ring.clone(),
            },
            self.options.fetch.clone(),
        );

        let mut reader = RingScanReader::new(ring.clone(), 0, self.options.read_timeout);
        let mut collector = MoovCollector::default();

        let grow_ring = ring.clone();
        let scan = BoxScanner::scan(&mut reader, &mut collector, |info| {
            // The probe capacity is a guess; when the movie box announces a
            // bigger size, enlarge the drained ring once so the payload read
            // does not have to cycle the buffer as often.
            if info.box_type == FourCc::MOOV {
                if let BoxSize::Sized(total) = info.box_size {
                    let wanted = total as usize;
                    if wanted > grow_ring.capacity() {
                        match grow_ring.grow_to(wanted.next_power_of_two()) {
                            Ok(()) => debug!(wanted, "metadata ring enlarged"),
                            Err(err) => debug!(%err, "metadata ring kept at probe size"),
                        }
                    }
                }
            }
            ScanControl::Continue
        });

        // The probe transfer is never reused for segment streaming.
        session.cancel();

        let summary = scan?;
        debug!(
            stopped_at = ?summary.stopped_at,
            brand = ?summary.major_brand,
            "metadata scan finished"
        );

        let tracks = collector
            .tracks
            .ok_or(StreamError::Mp4(Mp4Error::IncompleteMetadata))?;
        let asset = MediaAsset::build(
            tracks,
            self.ctx.ids().clone(),
            self.options.asset.clone(),
        );

        self.ctx.publish(StreamEvent::MetadataReady {
            track_count: asset.tracks().len(),
            duration: asset.get_total_duration(),
        });
        Ok(asset)
    }
}
