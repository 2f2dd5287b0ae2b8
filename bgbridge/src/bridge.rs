//! The bridge proper: chip reader, application reader and command writer.
//!
//! ```text
//!  chip ──FrameCodec──> ChipReader ──(rewritten / suppressed)──> application
//!    ^                      │ signal, observations
//!    │                      v
//!    └── CommandSequencer <── AppReader <──FrameCodec── application
//! ```

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bglib::protocol::{extended_scan_command, patch_discovery_timing};
use crate::bglib::{classify, ChipMessage, Frame, FrameCodec, Framing, Header, Kind, Outbound, Read};
use crate::config::ScanTiming;
use crate::discovery::{DiscoveryHandle, Observation};
use crate::gap::AdvertisementPipeline;
use crate::sequencer::{CommandSequencer, SequencerError};
use crate::tracing::prelude::*;
use crate::types::HexBytes;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("{0} link closed")]
    Closed(&'static str),

    #[error("{link} link I/O error: {source}")]
    Io {
        link: &'static str,
        source: io::Error,
    },

    #[error(transparent)]
    Sequencer(#[from] SequencerError),
}

fn io_error(link: &'static str) -> impl Fn(io::Error) -> BridgeError {
    move |source| BridgeError::Io { link, source }
}

/// Runs of stray chip bytes shorter than this are routine noise.
const SKIP_LOG_MIN: usize = 5;

/// Upper bound on stray bytes kept for one log line.
const SKIP_LOG_CAP: usize = 256;

/// Collects consecutive stray bytes so a resync is logged once.
#[derive(Default)]
struct SkipLog {
    bytes: BytesMut,
    total: usize,
}

impl SkipLog {
    fn push(&mut self, bytes: &[u8]) {
        let room = SKIP_LOG_CAP.saturating_sub(self.bytes.len());
        self.bytes.extend_from_slice(&bytes[..bytes.len().min(room)]);
        self.total += bytes.len();
    }

    fn flush(&mut self) {
        if self.total >= SKIP_LOG_MIN {
            warn!(count = self.total, data = %HexBytes(&self.bytes), "Skipped bytes from chip");
        }
        self.bytes.clear();
        self.total = 0;
    }
}

/// Reads the chip link and forwards to the application.
pub struct ChipReader<R, W> {
    input: FramedRead<R, FrameCodec>,
    output: FramedWrite<W, FrameCodec>,
    sequencer: Arc<CommandSequencer>,
    discovery: DiscoveryHandle,
    pipeline: AdvertisementPipeline,
    skipped: SkipLog,
}

impl<R, W> ChipReader<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        chip: R,
        chip_framing: Framing,
        app: W,
        app_framing: Framing,
        sequencer: Arc<CommandSequencer>,
        discovery: DiscoveryHandle,
        pipeline: AdvertisementPipeline,
    ) -> Self {
        Self {
            input: FramedRead::new(chip, FrameCodec::chip(chip_framing)),
            output: FramedWrite::new(app, FrameCodec::app(app_framing)),
            sequencer,
            discovery,
            pipeline,
            skipped: SkipLog::default(),
        }
    }

    /// Runs until the chip link closes or fails.
    pub async fn run(mut self) -> Result<(), BridgeError> {
        while let Some(read) = self.input.next().await {
            match read.map_err(io_error("chip"))? {
                Read::Frame(frame) => {
                    self.skipped.flush();
                    if let Some(frame) = self.handle(frame) {
                        self.forward(Outbound::Frame(frame)).await?;
                    }
                }
                Read::Wrong { bytes, reason } => {
                    trace!(data = %HexBytes(&bytes), %reason, "<=chip wrong");
                    self.skipped.push(&bytes);
                    // The application's own parser resyncs on these
                    self.forward(Outbound::Raw(bytes)).await?;
                }
            }
        }
        self.skipped.flush();
        Err(BridgeError::Closed("chip"))
    }

    async fn forward(&mut self, item: Outbound) -> Result<(), BridgeError> {
        self.output.send(item).await.map_err(io_error("application"))
    }

    /// Classify a chip frame, update state, and return what to forward.
    fn handle(&mut self, mut frame: Frame) -> Option<Frame> {
        trace!(frame = ?frame, "<=chip");
        self.discovery.observe(Observation::Activity);

        let message = classify(&frame);
        if frame.kind() == Kind::Command || matches!(message, ChipMessage::Boot(_)) {
            self.sequencer.signal_response_ready();
        }

        match message {
            ChipMessage::BtAddress(mac) => {
                self.discovery.observe(Observation::Address(mac));
                Some(frame)
            }
            // Response to a command the bridge injected
            ChipMessage::ExtendedScanSet => None,
            ChipMessage::Boot(version) => {
                let expected = self.sequencer.last_sent_was_reset();
                self.discovery.observe(Observation::Boot { expected });
                if expected {
                    info!(%version, "Chip booted");
                    Some(frame)
                } else {
                    info!(%version, "Chip booted without a reset request, not forwarding");
                    None
                }
            }
            ChipMessage::ScanResponse => match self.pipeline.process(&mut frame) {
                0 => None,
                _ => Some(frame),
            },
            ChipMessage::DiscoveryStarted | ChipMessage::Other => Some(frame),
        }
    }
}

/// Reads the application link and queues commands for the chip.
pub struct AppReader<R> {
    input: FramedRead<R, FrameCodec>,
    sequencer: Arc<CommandSequencer>,
    discovery: DiscoveryHandle,
    scan_timing: Option<ScanTiming>,
}

impl<R> AppReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(
        app: R,
        framing: Framing,
        sequencer: Arc<CommandSequencer>,
        discovery: DiscoveryHandle,
        scan_timing: Option<ScanTiming>,
    ) -> Self {
        Self {
            input: FramedRead::new(app, FrameCodec::app(framing)),
            sequencer,
            discovery,
            scan_timing,
        }
    }

    /// Runs until the application link closes or fails.
    pub async fn run(mut self) -> Result<(), BridgeError> {
        while let Some(read) = self.input.next().await {
            match read.map_err(io_error("application"))? {
                Read::Frame(frame) => self.handle(frame),
                Read::Wrong { bytes, reason } => {
                    debug!(data = %HexBytes(&bytes), %reason, "Dropping bytes from application");
                }
            }
        }
        Err(BridgeError::Closed("application"))
    }

    fn handle(&mut self, mut frame: Frame) {
        trace!(frame = ?frame, "<=app");
        match frame.header() {
            Some(Header::SystemReset) => {
                // Whatever was pending is moot, and the chip will not answer
                // the command being waited on
                self.sequencer.clear_queue();
                self.sequencer.signal_response_ready();
            }
            Some(Header::SetDiscoveryTiming) => {
                if let Some(timing) = self.scan_timing {
                    if patch_discovery_timing(&mut frame, timing.interval, timing.window) {
                        debug!(interval = timing.interval, window = timing.window, "Patched discovery timing");
                    }
                }
            }
            Some(Header::StartDiscovery) => {
                self.enqueue(extended_scan_command(true));
                self.discovery.observe(Observation::DiscoveryRequested);
            }
            _ => {}
        }
        self.enqueue(frame);
    }

    fn enqueue(&self, frame: Frame) {
        if let Err(e) = self.sequencer.enqueue(frame) {
            warn!(error = %e, "Dropping command from application");
        }
    }
}

/// Run the chip reader, the application reader and the command writer until
/// shutdown or until one of them fails.
#[allow(clippy::too_many_arguments)]
pub async fn run<C, A>(
    chip: C,
    chip_framing: Framing,
    app: A,
    app_framing: Framing,
    sequencer: Arc<CommandSequencer>,
    discovery: DiscoveryHandle,
    pipeline: AdvertisementPipeline,
    scan_timing: Option<ScanTiming>,
    shutdown: CancellationToken,
) -> Result<(), BridgeError>
where
    C: AsyncRead + AsyncWrite,
    A: AsyncRead + AsyncWrite,
{
    let (chip_rx, chip_tx) = tokio::io::split(chip);
    let (app_rx, app_tx) = tokio::io::split(app);

    let chip_reader = ChipReader::new(
        chip_rx,
        chip_framing,
        app_tx,
        app_framing,
        sequencer.clone(),
        discovery.clone(),
        pipeline,
    );
    let app_reader = AppReader::new(app_rx, app_framing, sequencer.clone(), discovery, scan_timing);
    let writer = FramedWrite::new(chip_tx, FrameCodec::chip(chip_framing));

    tokio::select! {
        _ = shutdown.cancelled() => Ok(()),
        result = chip_reader.run() => result,
        result = app_reader.run() => result,
        result = sequencer.run(writer, shutdown.clone()) => result.map_err(BridgeError::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bglib::test_data::{scan_response, ADDRESS};
    use crate::clock::TokioClock;
    use crate::discovery::{AdapterState, ChipSupervisor, DiscoveryActor, DiscoveryConfig};
    use crate::gap::PipelineConfig;
    use crate::sink::testing::RecordingSink;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    struct NoSupervisor;

    #[async_trait]
    impl ChipSupervisor for NoSupervisor {
        async fn restart_chip_process(&self) {}
        async fn on_discovery_start(&self) {}
    }

    /// The far ends of both links, as seen by the chip and the application.
    struct Harness {
        chip: DuplexStream,
        app: DuplexStream,
        discovery: DiscoveryHandle,
        sink: Arc<RecordingSink>,
        shutdown: CancellationToken,
    }

    fn start(scan_timing: Option<ScanTiming>) -> Harness {
        let (chip, chip_far) = duplex(4096);
        let (app, app_far) = duplex(4096);
        let sink = Arc::new(RecordingSink::default());
        let shutdown = CancellationToken::new();

        let (actor, discovery) =
            DiscoveryActor::new(DiscoveryConfig::default(), Arc::new(NoSupervisor), sink.clone());
        tokio::spawn(actor.run(shutdown.clone()));

        let pipeline = AdvertisementPipeline::new(
            PipelineConfig::default(),
            Arc::new(TokioClock),
            Arc::new(HashMap::new()),
            sink.clone(),
            sink.clone(),
        );
        tokio::spawn(run(
            chip,
            Framing::Unbracketed,
            app,
            Framing::Unbracketed,
            Arc::new(CommandSequencer::new()),
            discovery.clone(),
            pipeline,
            scan_timing,
            shutdown.clone(),
        ));

        Harness {
            chip: chip_far,
            app: app_far,
            discovery,
            sink,
            shutdown,
        }
    }

    async fn read_exact(stream: &mut DuplexStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0; n];
        tokio::time::timeout(Duration::from_secs(1), stream.read_exact(&mut buf))
            .await
            .expect("timed out")
            .unwrap();
        buf
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    async fn assert_quiet(stream: &mut DuplexStream) {
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(50), stream.read(&mut buf)).await;
        assert!(read.is_err(), "unexpected bytes: {:02x?}", buf);
    }

    const GET_ADDRESS: [u8; 4] = [0x20, 0x00, 0x01, 0x03];
    const ADDRESS_RSP: [u8; 10] = [0x20, 0x06, 0x01, 0x03, 0x6A, 0xD1, 0xCF, 0x44, 0xEF, 0x54];
    const HELLO: [u8; 4] = [0x20, 0x00, 0x01, 0x00];
    const HELLO_RSP: [u8; 6] = [0x20, 0x02, 0x01, 0x00, 0x00, 0x00];

    #[tokio::test]
    async fn commands_wait_for_responses() {
        let mut h = start(None);
        h.app.write_all(&GET_ADDRESS).await.unwrap();
        h.app.write_all(&HELLO).await.unwrap();

        assert_eq!(read_exact(&mut h.chip, 4).await, GET_ADDRESS);
        assert_quiet(&mut h.chip).await;

        h.chip.write_all(&ADDRESS_RSP).await.unwrap();
        assert_eq!(read_exact(&mut h.app, 10).await, ADDRESS_RSP);
        assert_eq!(read_exact(&mut h.chip, 4).await, HELLO);

        h.chip.write_all(&HELLO_RSP).await.unwrap();
        assert_eq!(read_exact(&mut h.app, 6).await, HELLO_RSP);

        settle().await;
        assert_eq!(h.discovery.state(), AdapterState::Setup);
        assert_eq!(
            *h.sink.addresses.lock().unwrap(),
            vec!["54:EF:44:CF:D1:6A".parse().unwrap()]
        );
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn start_discovery_injects_extended_scan() {
        let mut h = start(None);
        let start_discovery = [0x20, 0x01, 0x03, 0x18, 0x04];
        h.app.write_all(&start_discovery).await.unwrap();

        assert_eq!(read_exact(&mut h.chip, 5).await, [0x20, 0x01, 0x03, 0x1C, 0x01]);
        h.chip.write_all(&[0x20, 0x02, 0x03, 0x1C, 0x00, 0x00]).await.unwrap();
        assert_eq!(read_exact(&mut h.chip, 5).await, start_discovery);

        let started = [0x20, 0x02, 0x03, 0x18, 0x00, 0x00];
        h.chip.write_all(&started).await.unwrap();
        // The injected command's response is swallowed
        assert_eq!(read_exact(&mut h.app, 6).await, started);
        settle().await;
        assert_eq!(h.discovery.state(), AdapterState::Discovery);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn scan_responses_are_converted_and_deduplicated() {
        let mut h = start(None);
        let ad = [0x02, 0x01, 0x06];
        h.chip.write_all(&scan_response(ADDRESS, 0xC4, 0x25, &ad)).await.unwrap();
        let legacy = read_exact(&mut h.app, 15 + ad.len()).await;
        assert_eq!(&legacy[..6], &[0xA0, 0x0E, 0x03, 0x00, 0xC4, 0x00]);

        // Same advertisement on another channel
        h.chip.write_all(&scan_response(ADDRESS, 0xC0, 0x27, &ad)).await.unwrap();
        assert_quiet(&mut h.app).await;
        assert_eq!(h.sink.advertisements.lock().unwrap().len(), 1);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn unexpected_boot_is_not_forwarded() {
        let mut h = start(None);
        let mut boot = vec![0xA0, 0x12, 0x01, 0x00];
        boot.extend_from_slice(&[0x03, 0x00, 0x02, 0x00, 0x0D, 0x00]);
        boot.extend_from_slice(&[0x00; 12]);
        h.chip.write_all(&boot).await.unwrap();
        assert_quiet(&mut h.app).await;
        settle().await;
        assert_eq!(h.discovery.state(), AdapterState::Reset);

        // After a reset requested by the application it is
        h.app.write_all(&[0x20, 0x01, 0x01, 0x01, 0x00]).await.unwrap();
        assert_eq!(read_exact(&mut h.chip, 5).await, [0x20, 0x01, 0x01, 0x01, 0x00]);
        h.chip.write_all(&boot).await.unwrap();
        assert_eq!(read_exact(&mut h.app, boot.len()).await, boot);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn discovery_timing_is_patched() {
        let mut h = start(Some(ScanTiming {
            interval: 0x10,
            window: 0x10,
        }));
        h.app
            .write_all(&[0x20, 0x05, 0x03, 0x16, 0x01, 0xA0, 0x00, 0x30, 0x00])
            .await
            .unwrap();
        assert_eq!(
            read_exact(&mut h.chip, 9).await,
            [0x20, 0x05, 0x03, 0x16, 0x01, 0x10, 0x00, 0x10, 0x00]
        );
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn stray_chip_bytes_pass_through() {
        let mut h = start(None);
        h.chip.write_all(&[0x55, 0x20, 0x00]).await.unwrap();
        h.chip.write_all(&HELLO_RSP).await.unwrap();
        assert_eq!(read_exact(&mut h.app, 3).await, [0x55, 0x20, 0x00]);
        assert_eq!(read_exact(&mut h.app, 6).await, HELLO_RSP);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn closed_chip_link_ends_bridge() {
        let (chip, chip_far) = duplex(64);
        let (app, _app_far) = duplex(64);
        let sink = Arc::new(RecordingSink::default());
        let (_actor, discovery) =
            DiscoveryActor::new(DiscoveryConfig::default(), Arc::new(NoSupervisor), sink.clone());
        let pipeline = AdvertisementPipeline::new(
            PipelineConfig::default(),
            Arc::new(TokioClock),
            Arc::new(HashMap::new()),
            sink.clone(),
            sink,
        );
        drop(chip_far);

        let result = run(
            chip,
            Framing::Unbracketed,
            app,
            Framing::Unbracketed,
            Arc::new(CommandSequencer::new()),
            discovery,
            pipeline,
            None,
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(BridgeError::Closed("chip"))));
    }
}
