//! Flow-controlled streaming session for a single Ether Dream DAC.
//!
//! One session exists per device IP. The session owns a worker loop that
//! reacts to the device-reported playback state: a stopped device is
//! prepared, a prepared device is started, and a playing device is fed
//! bounded point batches while the estimated buffer fullness stays below the
//! target level. The loop re-arms immediately after each write completes and
//! falls back to a periodic safety tick otherwise; stopping the session
//! clears a flag so any in-flight iteration becomes a no-op.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};

use super::client::ProtocolClient;
use super::flow::BufferEstimator;
use super::protocol::{command, DacPoint, DacResponse, COMMUNICATION_PORT};
use crate::error::{Error, Result};
use crate::padding::pad;
use crate::types::{Frame, LaserPoint, OutputStatus, PlaybackState, StatusCallback};

/// Session tunables.
///
/// The buffer headroom and batch size values are empirically chosen for the
/// reference hardware; they are surfaced here rather than derived.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// TCP port the device listens on.
    pub port: u16,
    /// On-device buffer size in points.
    pub buffer_capacity: u16,
    /// Fill target as a percentage of capacity. Writes pause above this
    /// level, leaving headroom below the physical capacity.
    pub target_fill_percent: u32,
    /// Largest single data command, keeping flow control responsive.
    pub max_batch_points: usize,
    /// Window for any outstanding request to produce a status reply. An
    /// elapsed window counts as a null response, not an error.
    pub ack_timeout: Duration,
    pub connect_timeout: Duration,
    /// Re-arm interval for the session loop when no reply is driving it.
    pub safety_tick: Duration,
    /// Poll interval while the device buffer sits at its target.
    pub poll_interval: Duration,
    /// Bound on the per-device frame queue; the oldest frame is dropped
    /// when it overflows.
    pub frame_queue_limit: usize,
    /// Minimum wait before re-issuing begin when no state change follows.
    pub begin_cooldown: Duration,
    /// Rate differences at or below this many pps do not trigger an
    /// update-rate command.
    pub rate_tolerance: u32,
    /// Rate used when synthesizing all-blank output.
    pub blank_point_rate: u32,
    /// Refresh rate used to derive the per-refresh padding target.
    pub refresh_rate: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: COMMUNICATION_PORT,
            buffer_capacity: 1799,
            target_fill_percent: 95,
            max_batch_points: 100,
            ack_timeout: Duration::from_millis(1500),
            connect_timeout: Duration::from_secs(3),
            safety_tick: Duration::from_millis(100),
            poll_interval: Duration::from_millis(20),
            frame_queue_limit: 30,
            begin_cooldown: Duration::from_millis(500),
            rate_tolerance: 10,
            blank_point_rate: 12_000,
            refresh_rate: 30,
        }
    }
}

impl SessionConfig {
    fn target_fullness(&self) -> u32 {
        u32::from(self.buffer_capacity) * self.target_fill_percent / 100
    }

    fn points_per_refresh(&self, point_rate: u32) -> usize {
        (point_rate / self.refresh_rate).max(1) as usize
    }
}

enum ConnectState {
    Connecting,
    Connected,
    Failed(String),
}

struct Shared {
    ip: IpAddr,
    config: SessionConfig,
    started: AtomicBool,
    queue: Mutex<VecDeque<Frame>>,
    connect_state: Mutex<ConnectState>,
    connect_cond: Condvar,
    status_callback: Option<StatusCallback>,
}

impl Shared {
    fn set_connect_state(&self, state: ConnectState) {
        *self.connect_state.lock().unwrap() = state;
        self.connect_cond.notify_all();
    }
}

/// A streaming session bound to one device IP.
///
/// Created on the first frame submitted (or an explicit start) for that IP
/// and destroyed on explicit stop or connection loss.
pub struct StreamedSession {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StreamedSession {
    /// Spawn a session worker that connects to the device and starts the
    /// streaming loop.
    pub fn spawn(
        ip: IpAddr,
        config: SessionConfig,
        status_callback: Option<StatusCallback>,
    ) -> Self {
        let shared = Arc::new(Shared {
            ip,
            config,
            started: AtomicBool::new(true),
            queue: Mutex::new(VecDeque::new()),
            connect_state: Mutex::new(ConnectState::Connecting),
            connect_cond: Condvar::new(),
            status_callback,
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("beamlink-etherdream-{}", ip))
            .spawn(move || run(worker_shared));

        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                warn!("ether dream {}: failed to spawn session worker: {}", ip, e);
                shared.set_connect_state(ConnectState::Failed(e.to_string()));
                shared.started.store(false, Ordering::Release);
                None
            }
        };

        Self {
            shared,
            handle: Mutex::new(handle),
        }
    }

    /// Queue a frame for output. The queue is bounded; the oldest frame is
    /// dropped on overflow — delivery is best-effort latest-wins, not a
    /// guaranteed stream.
    pub fn enqueue(&self, frame: Frame) {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.push_back(frame);
        while queue.len() > self.shared.config.frame_queue_limit {
            queue.pop_front();
        }
    }

    /// Wait for the session's connection attempt to resolve.
    pub fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let state = self.shared.connect_state.lock().unwrap();
        let (state, wait) = self
            .shared
            .connect_cond
            .wait_timeout_while(state, timeout, |s| matches!(s, ConnectState::Connecting))
            .unwrap();

        match &*state {
            ConnectState::Connected => Ok(()),
            ConnectState::Failed(msg) => Err(Error::connect_failed(msg.clone())),
            ConnectState::Connecting => {
                debug_assert!(wait.timed_out());
                Err(Error::Timeout)
            }
        }
    }

    /// Returns false once the session has shut down (stop or connect failure).
    pub fn is_active(&self) -> bool {
        self.shared.started.load(Ordering::Acquire)
    }

    /// Stop the session and join its worker.
    ///
    /// The started flag is cleared first so any scheduled loop iteration
    /// lands as a no-op; the worker sends a best-effort stop command on the
    /// way out.
    pub fn stop(&self) {
        self.shared.started.store(false, Ordering::Release);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StreamedSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// What the loop should do after a step.
enum StepOutcome {
    /// Made progress; run the next step immediately.
    Progress,
    /// Nothing to do right now.
    Sleep(Duration),
    /// The connection is gone; tear the session down.
    Abort,
}

fn run(shared: Arc<Shared>) {
    let config = shared.config.clone();
    let addr = SocketAddr::new(shared.ip, config.port);

    let (client, hello) = match ProtocolClient::connect(addr, config.connect_timeout) {
        Ok(pair) => pair,
        Err(e) => {
            warn!("ether dream {}: connect failed: {}", shared.ip, e);
            // No retry queue is carried across failed connects.
            shared.queue.lock().unwrap().clear();
            shared.set_connect_state(ConnectState::Failed(e.to_string()));
            shared.started.store(false, Ordering::Release);
            return;
        }
    };

    debug!("ether dream {}: connected", shared.ip);
    shared.set_connect_state(ConnectState::Connected);

    let mut worker = SessionWorker::new(&shared, config, client);
    worker.apply_reply(&hello);

    while shared.started.load(Ordering::Acquire) {
        match worker.step() {
            StepOutcome::Progress => {}
            StepOutcome::Sleep(duration) => thread::sleep(duration),
            StepOutcome::Abort => {
                warn!("ether dream {}: connection lost", shared.ip);
                shared.started.store(false, Ordering::Release);
                break;
            }
        }
    }

    // Best-effort teardown; transport errors here are swallowed.
    let _ = worker.client.write_command(command::Stop);
    let _ = worker.client.read_reply(Duration::from_millis(200));
    debug!("ether dream {}: session closed", shared.ip);
}

struct SessionWorker<'a> {
    shared: &'a Shared,
    config: SessionConfig,
    client: ProtocolClient,
    flow: BufferEstimator,
    playback: PlaybackState,
    /// Points of the frame currently being streamed, already padded and
    /// converted to wire records.
    pending: VecDeque<DacPoint>,
    /// Last frame handed to the device, kept for starvation synthesis.
    last_good: Option<Frame>,
    current_rate: u32,
    last_begin: Option<Instant>,
    emergency_stop: bool,
}

impl<'a> SessionWorker<'a> {
    fn new(shared: &'a Shared, config: SessionConfig, client: ProtocolClient) -> Self {
        let capacity = u32::from(config.buffer_capacity);
        let blank_rate = config.blank_point_rate;
        let mut flow = BufferEstimator::new(capacity);
        flow.set_point_rate(blank_rate);
        Self {
            shared,
            config,
            client,
            flow,
            playback: PlaybackState::Idle,
            pending: VecDeque::new(),
            last_good: None,
            current_rate: blank_rate,
            last_begin: None,
            emergency_stop: false,
        }
    }

    fn step(&mut self) -> StepOutcome {
        if self.emergency_stop {
            return self.clear_emergency_stop();
        }

        match self.playback {
            PlaybackState::Idle => self.prepare(),
            PlaybackState::Prepared => self.begin(),
            PlaybackState::Playing => self.stream(),
        }
    }

    /// Device reports stopped: issue prepare and wait for its ack before
    /// resuming writes.
    fn prepare(&mut self) -> StepOutcome {
        debug!("ether dream {}: preparing stream", self.shared.ip);
        match self.control_request(command::PrepareStream) {
            Ok(Some(_)) => {
                if self.playback == PlaybackState::Idle {
                    // No state change; don't hammer the device.
                    StepOutcome::Sleep(self.config.safety_tick)
                } else {
                    StepOutcome::Progress
                }
            }
            Ok(None) => StepOutcome::Sleep(self.config.safety_tick),
            Err(e) => {
                warn!("ether dream {}: prepare failed: {}", self.shared.ip, e);
                StepOutcome::Abort
            }
        }
    }

    /// Device is prepared: start playback, at most once per saturation
    /// event, with a cooldown before retrying when no state change follows.
    fn begin(&mut self) -> StepOutcome {
        if let Some(at) = self.last_begin {
            if at.elapsed() < self.config.begin_cooldown {
                return StepOutcome::Sleep(self.config.poll_interval);
            }
        }

        let point_rate = self.desired_rate();
        debug!(
            "ether dream {}: begin playback at {} pps",
            self.shared.ip, point_rate
        );
        match self.control_request(command::Begin {
            low_water_mark: 0,
            point_rate,
        }) {
            Ok(Some(_)) => {
                self.last_begin = Some(Instant::now());
                self.current_rate = point_rate;
                self.flow.set_point_rate(point_rate);
                StepOutcome::Progress
            }
            Ok(None) => {
                self.last_begin = Some(Instant::now());
                StepOutcome::Sleep(self.config.safety_tick)
            }
            Err(e) => {
                warn!("ether dream {}: begin failed: {}", self.shared.ip, e);
                StepOutcome::Abort
            }
        }
    }

    /// Device is playing: keep the buffer near its target with bounded
    /// batches.
    fn stream(&mut self) -> StepOutcome {
        let now = Instant::now();
        if self.flow.estimated_fullness(now) >= self.config.target_fullness() {
            return StepOutcome::Sleep(self.config.poll_interval);
        }

        if self.pending.is_empty() {
            if let Err(e) = self.refill_pending() {
                warn!("ether dream {}: rate update failed: {}", self.shared.ip, e);
                return StepOutcome::Abort;
            }
        }

        let batch_len = self.pending.len().min(self.config.max_batch_points);
        let points: Vec<DacPoint> = self.pending.drain(..batch_len).collect();

        let data = command::Data {
            points: std::borrow::Cow::from(&points[..]),
        };
        if let Err(e) = self.client.write_command(&data) {
            warn!("ether dream {}: write failed: {}", self.shared.ip, e);
            return StepOutcome::Abort;
        }
        self.flow.record_write(batch_len as u32);

        match self.client.read_reply(self.config.ack_timeout) {
            Ok(Some(reply)) => {
                self.flow
                    .acknowledge(reply.dac_status.buffer_fullness, Instant::now());
                self.apply_reply(&reply);
                StepOutcome::Progress
            }
            Ok(None) => {
                // Null response: settle the oldest batch so the FIFO stays
                // consistent instead of growing unbounded.
                self.flow.acknowledge_lost();
                StepOutcome::Progress
            }
            Err(e) => {
                warn!("ether dream {}: read failed: {}", self.shared.ip, e);
                StepOutcome::Abort
            }
        }
    }

    fn clear_emergency_stop(&mut self) -> StepOutcome {
        warn!("ether dream {}: clearing emergency stop", self.shared.ip);
        self.emergency_stop = false;
        match self.control_request(command::ClearEmergencyStop) {
            Ok(_) => {
                self.playback = PlaybackState::Idle;
                StepOutcome::Sleep(self.config.safety_tick)
            }
            Err(e) => {
                warn!(
                    "ether dream {}: clear emergency stop failed: {}",
                    self.shared.ip, e
                );
                StepOutcome::Abort
            }
        }
    }

    /// Rate the next output should play at: the queued frame's rate wins,
    /// then the last delivered frame's, then the blanking fallback.
    fn desired_rate(&self) -> u32 {
        let queued = self.shared.queue.lock().unwrap().front().map(|f| f.rate);
        queued
            .or_else(|| self.last_good.as_ref().map(|f| f.rate))
            .filter(|&rate| rate > 0)
            .unwrap_or(self.config.blank_point_rate)
    }

    /// Refill the pending point cursor from the frame queue, synthesizing
    /// output on starvation so the device never idles unexpectedly.
    fn refill_pending(&mut self) -> std::io::Result<()> {
        let next = self.shared.queue.lock().unwrap().pop_front();

        let (points, rate) = match next {
            Some(frame) => {
                let rate = if frame.rate > 0 {
                    frame.rate
                } else {
                    self.current_rate
                };
                let target = self.config.points_per_refresh(rate);
                let padded = pad(&frame.points, target);
                self.last_good = Some(frame);
                (padded, rate)
            }
            None => match &self.last_good {
                // Starvation: repeat the last delivered frame at the
                // current rate.
                Some(frame) => {
                    let target = self.config.points_per_refresh(self.current_rate);
                    (pad(&frame.points, target), self.current_rate)
                }
                // Nothing was ever delivered: hold the beam dark at center.
                None => {
                    let rate = self.config.blank_point_rate;
                    let target = self.config.points_per_refresh(rate);
                    (vec![LaserPoint::blanked(0.0, 0.0); target], rate)
                }
            },
        };

        // An empty frame has nothing to draw; hold the beam dark instead of
        // issuing zero-point writes.
        if points.is_empty() {
            let target = self.config.points_per_refresh(self.current_rate);
            let blank = DacPoint::from(&LaserPoint::blanked(0.0, 0.0));
            self.pending.extend(std::iter::repeat(blank).take(target));
            return Ok(());
        }

        if rate.abs_diff(self.current_rate) > self.config.rate_tolerance {
            self.update_rate(rate)?;
        }

        self.pending.extend(points.iter().map(DacPoint::from));
        Ok(())
    }

    /// Send an update-rate command and wait for its ack before any batch is
    /// written at the new rate.
    fn update_rate(&mut self, point_rate: u32) -> std::io::Result<()> {
        debug!(
            "ether dream {}: update rate {} -> {} pps",
            self.shared.ip, self.current_rate, point_rate
        );
        let reply = self.control_request(command::Update {
            low_water_mark: 0,
            point_rate,
        })?;
        if reply.is_none() {
            debug!(
                "ether dream {}: no reply to rate update",
                self.shared.ip
            );
        }
        self.current_rate = point_rate;
        self.flow.set_point_rate(point_rate);
        Ok(())
    }

    /// Send a non-data command and fold its reply into the session state.
    fn control_request<C>(&mut self, cmd: C) -> std::io::Result<Option<DacResponse>>
    where
        C: command::Command + super::protocol::WriteToBytes,
    {
        let reply = self.client.request(cmd, self.config.ack_timeout)?;
        if let Some(r) = &reply {
            self.flow
                .sync_report(r.dac_status.buffer_fullness, Instant::now());
            self.apply_reply(r);
        }
        Ok(reply)
    }

    /// Fold a status reply into the session: playback state, flow control
    /// mode, emergency-stop recovery, and the status push to the host.
    fn apply_reply(&mut self, reply: &DacResponse) {
        if let Some(playback) = reply.dac_status.playback() {
            self.playback = playback;
        }
        self.flow
            .set_playing(self.playback == PlaybackState::Playing);

        if reply.dac_status.is_emergency_stop() {
            self.emergency_stop = true;
        }

        if !reply.is_ack() {
            warn!(
                "ether dream {}: NAK 0x{:02x} for command 0x{:02x}",
                self.shared.ip, reply.response, reply.command
            );
        }

        if reply
            .dac_status
            .playback_flags()
            .contains(super::protocol::PlaybackFlags::UNDERFLOWED)
        {
            debug!("ether dream {}: device reports underflow", self.shared.ip);
        }

        if let Some(callback) = &self.shared.status_callback {
            if let Some(playback) = reply.dac_status.playback() {
                callback(
                    self.shared.ip,
                    OutputStatus {
                        playback,
                        buffer_fullness: reply.dac_status.buffer_fullness,
                        buffer_capacity: self.config.buffer_capacity,
                        point_rate: reply.dac_status.point_rate,
                    },
                );
            }
        }
    }
}
