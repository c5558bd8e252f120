//! Frame acquisition loop.
//!
//! A [`ScanSession`] owns the camera, the calibration and the rectification
//! map for the duration of a run. Each call to [`ScanSession::next_record`]
//! reads one frame, rectifies it, advances the reference detector and, once a
//! laser plane is known, reconstructs the stripe in 3D. [`ScanSession::spawn`]
//! moves the loop onto a worker thread that hands records to the consumer
//! over a bounded channel.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use image::imageops;
use image::{GrayImage, RgbImage};
use nalgebra::Point3;

use crate::calibration::CalibrationModel;
use crate::config::{ScanConfig, TARGET_HEIGHT, TARGET_WIDTH};
use crate::error::{Result, ScanError};
use crate::geometry::PlaneEquation;
use crate::rectify::{self, RectificationMap};
use crate::reference::{ReferenceDetector, ReferenceInput, ReferenceStatus};
use crate::source::FrameSource;
use crate::stripe::{extract_full_frame, stripe_pixels};
use crate::triangulate::backproject;

/// How long a blocked hand-off waits before re-checking cancellation
const SEND_POLL: Duration = Duration::from_millis(50);

/// Operating phase reported with every record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No frame read yet, or the loop has stopped
    Idle,
    /// Grabbing the stripe-free background frame
    Capturing,
    /// Waiting for the reference detector to produce a plane
    Referencing,
    /// Reconstructing stripe points on the reference plane
    Scanning,
}

impl Phase {
    /// Numeric mode tag understood by display clients
    pub fn mode(&self) -> u8 {
        match self {
            Phase::Idle => 0,
            Phase::Capturing => 1,
            Phase::Referencing => 2,
            Phase::Scanning => 3,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Capturing => "view mode",
            Phase::Referencing => "reference mode",
            Phase::Scanning => "scan mode",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Devices validated, first frame not yet delivered
    AwaitingDevices,
    Streaming,
    PlaneEstablished,
    Terminated,
}

/// Auxiliary data attached to a record
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    /// Distortion of the rectified stream (all zeros)
    Distortion(Vec<f64>),
    /// The established reference plane
    Plane(PlaneEquation),
}

/// Immutable snapshot produced by one loop iteration.
#[derive(Debug, Clone)]
pub struct ScanRecord {
    pub index: u64,
    /// Rectified grayscale frame for display, mirrored when configured
    pub frame: GrayImage,
    pub phase: Phase,
    pub elapsed: Duration,
    pub capture_progress: f64,
    pub processing_progress: f64,
    pub resource: Resource,
    /// Stripe points in camera coordinates; `None` when not scanning or when
    /// the frame was skipped
    pub points: Option<Vec<Point3<f64>>>,
}

impl fmt::Display for ScanRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (capture, processing) = if self.phase == Phase::Capturing {
            (0.0, 0.0)
        } else {
            (self.capture_progress * 100.0, self.processing_progress * 100.0)
        };
        write!(
            f,
            "[record {}] mode: {} -- elapsed: {:.2}s -- capture: {:.2}% -- processing: {:.2}%",
            self.index,
            self.phase,
            self.elapsed.as_secs_f64(),
            capture,
            processing
        )?;
        if let Some(points) = &self.points {
            write!(f, " -- points: {}", points.len())?;
        }
        Ok(())
    }
}

/// Push-only status channel read by the UI layer.
pub trait StatusSink: Send {
    fn set_status(&mut self, status: &str);

    fn set_progress(&mut self, capture: f64, processing: f64);
}

/// Status sink that writes to the log.
#[derive(Debug, Default)]
pub struct LogStatus;

impl StatusSink for LogStatus {
    fn set_status(&mut self, status: &str) {
        log::info!("{}", status);
    }

    fn set_progress(&mut self, capture: f64, processing: f64) {
        log::trace!("progress: capture {:.2}, processing {:.2}", capture, processing);
    }
}

/// Cooperative cancellation shared between the worker and its controller.
///
/// Besides the flag, cancelling posts a wake-up message so a worker sleeping
/// in [`CancellationToken::wait_timeout`] returns immediately. The wake-up is
/// delivered to one waiter; every later wait returns at once through the flag.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            wake_tx,
            wake_rx,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        let _ = self.wake_tx.try_send(());
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Sleep for `timeout` unless cancelled first. Returns `true` if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        match self.wake_rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) => self.is_cancelled(),
            Err(RecvTimeoutError::Disconnected) => true,
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Single owner of the hardware a session needs.
pub struct DeviceContext<S> {
    source: Option<S>,
    calibration: Option<CalibrationModel>,
    calibration_resolution: (u32, u32),
    rectification: Option<RectificationMap>,
}

impl<S: FrameSource> DeviceContext<S> {
    pub fn new() -> Self {
        Self {
            source: None,
            calibration: None,
            calibration_resolution: (TARGET_WIDTH, TARGET_HEIGHT),
            rectification: None,
        }
    }

    pub fn with_source(mut self, source: S) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_calibration(mut self, calibration: CalibrationModel) -> Self {
        self.set_calibration(calibration);
        self
    }

    /// Resolution of the images the calibration was computed from
    pub fn with_calibration_resolution(mut self, resolution: (u32, u32)) -> Self {
        self.calibration_resolution = resolution;
        self.rectification = None;
        self
    }

    /// Replace the calibration; the rectification map is rebuilt at the next start.
    pub fn set_calibration(&mut self, calibration: CalibrationModel) {
        self.calibration = Some(calibration);
        self.rectification = None;
    }

    pub fn calibration(&self) -> Option<&CalibrationModel> {
        self.calibration.as_ref()
    }

    pub fn rectification(&self) -> Option<&RectificationMap> {
        self.rectification.as_ref()
    }

    pub fn source(&self) -> Option<&S> {
        self.source.as_ref()
    }

    pub fn take_source(&mut self) -> Option<S> {
        self.source.take()
    }

    fn ensure_ready(&self) -> Result<()> {
        match &self.source {
            None => return Err(ScanError::DeviceNotReady("no camera source".into())),
            Some(source) if !source.is_open() => {
                return Err(ScanError::DeviceNotReady("camera source is not open".into()))
            }
            Some(_) => {}
        }
        if self.calibration.is_none() {
            return Err(ScanError::DeviceNotReady("no calibration loaded".into()));
        }
        Ok(())
    }

    /// The map for the current calibration, built on first use
    fn take_rectification(&mut self) -> Result<RectificationMap> {
        if let Some(map) = self.rectification.take() {
            return Ok(map);
        }
        let calibration = self
            .calibration
            .as_ref()
            .ok_or_else(|| ScanError::DeviceNotReady("no calibration loaded".into()))?;
        rectify::precompute(calibration, self.calibration_resolution)
    }
}

impl<S: FrameSource> Default for DeviceContext<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// A failed start, handing the devices back to the caller.
pub struct SessionStartError<S> {
    pub error: ScanError,
    pub context: DeviceContext<S>,
}

impl<S> SessionStartError<S> {
    pub fn into_parts(self) -> (ScanError, DeviceContext<S>) {
        (self.error, self.context)
    }
}

impl<S> fmt::Debug for SessionStartError<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStartError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<S> fmt::Display for SessionStartError<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to start scan session: {}", self.error)
    }
}

impl<S> std::error::Error for SessionStartError<S> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Totals reported when a session ends.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub frames_read: u64,
    pub records: u64,
    pub plane: Option<PlaneEquation>,
    pub state: SessionState,
}

/// The frame-generation loop.
pub struct ScanSession<S> {
    context: DeviceContext<S>,
    map: RectificationMap,
    config: ScanConfig,
    detector: Box<dyn ReferenceDetector>,
    status: Box<dyn StatusSink>,
    token: CancellationToken,
    state: SessionState,
    phase: Phase,
    started: Instant,
    last_read: Option<Instant>,
    background: Option<RgbImage>,
    plane: Option<PlaneEquation>,
    frames_read: u64,
    records: u64,
}

impl<S: FrameSource> ScanSession<S> {
    /// Validate the devices and build the rectification map. The session
    /// waits in `AwaitingDevices` until the first frame arrives.
    ///
    /// Nothing is read and no map is built unless both a open source and a
    /// calibration are present.
    pub fn start(
        mut context: DeviceContext<S>,
        config: ScanConfig,
        detector: Box<dyn ReferenceDetector>,
    ) -> std::result::Result<Self, SessionStartError<S>> {
        if let Err(error) = context.ensure_ready() {
            log::warn!("Session not started: {}", error);
            return Err(SessionStartError { error, context });
        }
        let map = match context.take_rectification() {
            Ok(map) => map,
            Err(error) => {
                log::warn!("Session not started: {}", error);
                return Err(SessionStartError { error, context });
            }
        };

        if let Some((w, h)) = context.source.as_ref().and_then(|s| s.resolution()) {
            if (w, h) != (TARGET_WIDTH, TARGET_HEIGHT) {
                log::info!(
                    "Source delivers {}x{}, frames are resized to {}x{}",
                    w,
                    h,
                    TARGET_WIDTH,
                    TARGET_HEIGHT
                );
            }
        }
        log::info!("Scan session started (reference: {})", detector.name());

        Ok(Self {
            context,
            map,
            config,
            detector,
            status: Box::new(LogStatus),
            token: CancellationToken::new(),
            state: SessionState::AwaitingDevices,
            phase: Phase::Idle,
            started: Instant::now(),
            last_read: None,
            background: None,
            plane: None,
            frames_read: 0,
            records: 0,
        })
    }

    pub fn with_status(mut self, status: Box<dyn StatusSink>) -> Self {
        self.status = status;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn plane(&self) -> Option<PlaneEquation> {
        self.plane
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    pub fn rectification(&self) -> &RectificationMap {
        &self.map
    }

    /// Hand the devices back, keeping the map for the next start.
    pub fn into_context(self) -> DeviceContext<S> {
        let mut context = self.context;
        context.rectification = Some(self.map);
        context
    }

    fn terminate(&mut self, error: ScanError) -> ScanError {
        self.state = SessionState::Terminated;
        self.phase = Phase::Idle;
        self.status.set_status(&format!("Scan stopped: {}", error));
        error
    }

    /// Run one iteration. `Ok(None)` once cancelled or terminated.
    pub fn next_record(&mut self) -> Result<Option<ScanRecord>> {
        if self.state == SessionState::Terminated {
            return Ok(None);
        }
        if self.token.is_cancelled()
            || (self.last_read.is_some() && self.token.wait_timeout(self.config.read_interval()))
        {
            self.phase = Phase::Idle;
            return Ok(None);
        }

        let raw = match self.context.source.as_mut().and_then(|s| s.read_frame()) {
            Some(frame) => frame,
            None => {
                let error = ScanError::FrameReadError("source returned no frame".into());
                return Err(self.terminate(error));
            }
        };
        self.last_read = Some(Instant::now());
        self.frames_read += 1;
        if self.state == SessionState::AwaitingDevices {
            self.state = SessionState::Streaming;
        }

        let camera_matrix = *self.map.optimized_camera_matrix();
        // detection and reconstruction work on the camera's own orientation;
        // only the display copy is mirrored
        let frame = match rectify::apply(&self.map, &raw) {
            Ok(frame) => frame,
            Err(error) => return Err(self.terminate(error)),
        };
        let elapsed = self.started.elapsed();

        if self.background.is_none() {
            self.background = Some(frame.clone());
            self.phase = Phase::Capturing;
            self.status.set_status("Background captured, waiting for reference plane");
        } else if self.plane.is_none() {
            self.phase = Phase::Referencing;
        }

        let mut capture_progress = 0.0;
        if self.plane.is_none() {
            let input = ReferenceInput {
                frame: &frame,
                background: self.background.as_ref(),
                elapsed,
                camera_matrix: &camera_matrix,
            };
            match self.detector.observe(&input) {
                Ok(ReferenceStatus::Pending { progress }) => capture_progress = progress,
                Ok(ReferenceStatus::Established(plane)) => {
                    self.plane = Some(plane);
                    self.state = SessionState::PlaneEstablished;
                    self.phase = Phase::Scanning;
                    self.status.set_status(&format!(
                        "Reference plane established after {:.1}s",
                        elapsed.as_secs_f64()
                    ));
                }
                Err(e) if e.is_recoverable() => {
                    log::debug!("Reference detection skipped frame: {}", e);
                }
                Err(e) => return Err(self.terminate(e)),
            }
        }

        let mut processing_progress = 0.0;
        let mut points = None;
        if let Some(plane) = self.plane {
            capture_progress = 1.0;
            processing_progress = 1.0;
            match self.reconstruct(&frame, &plane, &camera_matrix) {
                Ok(p) => points = Some(p),
                Err(e) if e.is_recoverable() => {
                    log::debug!("Frame {} skipped for reconstruction: {}", self.frames_read, e);
                }
                Err(e) => return Err(self.terminate(e)),
            }
        }

        self.status.set_progress(capture_progress, processing_progress);

        let resource = match self.plane {
            Some(plane) => Resource::Plane(plane),
            None => Resource::Distortion(self.map.optimized_dist_coeffs().to_vec()),
        };

        let mut display = imageops::grayscale(&frame);
        if self.config.mirror {
            imageops::flip_horizontal_in_place(&mut display);
        }

        let record = ScanRecord {
            index: self.records,
            frame: display,
            phase: self.phase,
            elapsed,
            capture_progress,
            processing_progress,
            resource,
            points,
        };
        self.records += 1;
        Ok(Some(record))
    }

    /// Backproject the stripe of `frame` onto `plane` in camera coordinates.
    fn reconstruct(
        &self,
        frame: &RgbImage,
        plane: &PlaneEquation,
        camera_matrix: &nalgebra::Matrix3<f64>,
    ) -> Result<Vec<Point3<f64>>> {
        let background = self
            .background
            .as_ref()
            .ok_or_else(|| ScanError::DegenerateGeometry("no background frame".into()))?;
        let mask = extract_full_frame(background, frame)?;
        backproject(&stripe_pixels(&mask), plane, camera_matrix)
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            frames_read: self.frames_read,
            records: self.records,
            plane: self.plane,
            state: self.state,
        }
    }

    /// Drive the loop until cancelled, terminated or the consumer hangs up.
    pub fn run(&mut self, sink: &Sender<ScanRecord>) -> Result<SessionSummary> {
        'frames: while let Some(mut record) = self.next_record()? {
            loop {
                match sink.send_timeout(record, SEND_POLL) {
                    Ok(()) => break,
                    Err(SendTimeoutError::Timeout(r)) => {
                        if self.token.is_cancelled() {
                            break 'frames;
                        }
                        record = r;
                    }
                    Err(SendTimeoutError::Disconnected(_)) => {
                        log::debug!("Record consumer disconnected");
                        break 'frames;
                    }
                }
            }
        }
        log::info!(
            "Scan session finished: {} frames read, {} records",
            self.frames_read,
            self.records
        );
        Ok(self.summary())
    }
}

impl<S: FrameSource + 'static> ScanSession<S> {
    /// Move the loop onto a dedicated worker thread.
    pub fn spawn(mut self) -> Result<SessionHandle> {
        let (tx, rx) = crossbeam_channel::bounded(self.config.channel_capacity.max(1));
        let token = self.token.clone();

        let thread = std::thread::Builder::new()
            .name("scan-session".to_string())
            .spawn(move || {
                let result = self.run(&tx);
                if let Err(e) = &result {
                    log::error!("Scan session failed: {}", e);
                }
                result
            })?;

        Ok(SessionHandle {
            records: rx,
            token,
            thread: Some(thread),
        })
    }
}

/// Consumer side of a spawned session.
pub struct SessionHandle {
    records: Receiver<ScanRecord>,
    token: CancellationToken,
    thread: Option<JoinHandle<Result<SessionSummary>>>,
}

impl SessionHandle {
    pub fn records(&self) -> &Receiver<ScanRecord> {
        &self.records
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the worker to exit and return how the session ended.
    pub fn join(mut self) -> Result<SessionSummary> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| ScanError::WorkerPanicked)?,
            None => Err(ScanError::WorkerPanicked),
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.token.cancel();
        }
    }
}
