//! Bridge event loop.
//!
//! A single task owns the modem channel, the SIM-path controllers and the
//! signal monitor. Everything else talks to it through a cloneable
//! [`BridgeHandle`]. Because only this task touches the channel, AT requests
//! are naturally serialized: one request is in flight at a time, further
//! APDUs queue behind it, and a signal poll that comes due while anything is
//! outstanding is skipped.

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use remsim_common::models::{ModemId, ModemSetup, SimPath, StatsSnapshot};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::at;
use crate::channel::{ModemChannel, ReadOutcome};
use crate::demux::{self, FinalResult, LineBuffer};
use crate::error::BridgeError;
use crate::gpio::Gpio;
use crate::monitor::SignalMonitor;
use crate::session::{SessionHandler, SlotStatus};
use crate::sim_path::SimPathController;
use crate::stats::Statistics;

/// Longest ATR the bridge will store.
pub const ATR_SIZE_MAX: usize = 55;

/// How long an AT request may wait for its final result code.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

const COMMAND_QUEUE_DEPTH: usize = 64;

/// Environment variable handed to event scripts.
pub const SCRIPT_ENV_MODEM_DEVICE: &str = "OPENWRT_MODEM_DEVICE";

/// Static bridge parameters, fixed at construction.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub setup: ModemSetup,
    /// Signal poll interval in seconds; `<= 0` disables polling.
    pub signal_interval_secs: i64,
}

/// Open the primary modem's AT channel, degrading to a disabled channel.
///
/// A missing or unopenable device is not fatal: APDU forwarding is disabled
/// and the path is kept so the signal monitor can retry later.
pub fn open_primary_channel(setup: &ModemSetup) -> ModemChannel {
    let Some(path) = setup.primary().device_path.as_deref() else {
        tracing::warn!("no modem device configured, APDU forwarding disabled");
        return ModemChannel::disabled();
    };
    match ModemChannel::open(path) {
        Ok(channel) => channel,
        Err(e) => {
            tracing::warn!(error = %e, "APDU forwarding disabled until the device reappears");
            ModemChannel::unopened(path)
        }
    }
}

/// Variables the event script should see for this modem setup.
pub fn script_env(setup: &ModemSetup) -> Vec<(String, String)> {
    setup
        .primary()
        .device_path
        .as_deref()
        .map(Path::display)
        .map(|device| vec![(SCRIPT_ENV_MODEM_DEVICE.to_string(), device.to_string())])
        .unwrap_or_default()
}

// ── Commands ────────────────────────────────────────────────────────

type Reply<T> = oneshot::Sender<T>;

#[derive(Debug)]
enum BridgeCommand {
    TransmitApdu {
        apdu: Bytes,
        reply: Reply<Result<(), BridgeError>>,
    },
    SelectPath {
        modem: ModemId,
        path: SimPath,
        reply: Reply<Result<(), BridgeError>>,
    },
    ResetModem {
        modem: ModemId,
        reply: Reply<Result<(), BridgeError>>,
    },
    SetAtr {
        atr: Bytes,
        reply: Reply<Result<(), BridgeError>>,
    },
    SlotStatus(SlotStatus),
    SetSignalInterval(i64),
    Stats(Reply<StatsSnapshot>),
    Shutdown(Reply<StatsSnapshot>),
}

/// Cloneable front door to a running [`Bridge`].
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    tx: mpsc::Sender<BridgeCommand>,
    stats: Arc<Statistics>,
}

impl BridgeHandle {
    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> BridgeCommand) -> Result<T, BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| BridgeError::Stopped)?;
        rx.await.map_err(|_| BridgeError::Stopped)
    }

    /// Relay a command APDU to the modem.
    ///
    /// Resolves once the `AT+CSIM` command has been written in full. The
    /// response arrives later through [`SessionHandler::on_apdu`].
    pub async fn transmit_apdu(&self, apdu: impl Into<Bytes>) -> Result<(), BridgeError> {
        let apdu = apdu.into();
        self.call(|reply| BridgeCommand::TransmitApdu { apdu, reply })
            .await?
    }

    pub async fn select_path(&self, modem: ModemId, path: SimPath) -> Result<(), BridgeError> {
        self.call(|reply| BridgeCommand::SelectPath { modem, path, reply })
            .await?
    }

    pub async fn request_remote(&self, modem: ModemId) -> Result<(), BridgeError> {
        self.select_path(modem, SimPath::Remote).await
    }

    pub async fn request_local(&self, modem: ModemId) -> Result<(), BridgeError> {
        self.select_path(modem, SimPath::Local).await
    }

    /// The remote card became available: route the modem to it.
    pub async fn request_card_insert(&self, modem: ModemId) -> Result<(), BridgeError> {
        self.request_remote(modem).await
    }

    /// The remote card went away: fall back to the local SIM.
    pub async fn request_card_remove(&self, modem: ModemId) -> Result<(), BridgeError> {
        self.request_local(modem).await
    }

    pub async fn reset_modem(&self, modem: ModemId) -> Result<(), BridgeError> {
        self.call(|reply| BridgeCommand::ResetModem { modem, reply })
            .await?
    }

    /// Store the ATR announced by the remote card. At most [`ATR_SIZE_MAX`] bytes.
    pub async fn set_atr(&self, atr: impl Into<Bytes>) -> Result<(), BridgeError> {
        let atr = atr.into();
        self.call(|reply| BridgeCommand::SetAtr { atr, reply })
            .await?
    }

    /// Forward a slot status update to the session handler.
    pub async fn slot_status(&self, status: SlotStatus) -> Result<(), BridgeError> {
        self.tx
            .send(BridgeCommand::SlotStatus(status))
            .await
            .map_err(|_| BridgeError::Stopped)
    }

    pub async fn set_signal_interval(&self, interval_secs: i64) -> Result<(), BridgeError> {
        self.tx
            .send(BridgeCommand::SetSignalInterval(interval_secs))
            .await
            .map_err(|_| BridgeError::Stopped)
    }

    /// Counters plus the latest signal sample and stored ATR.
    pub async fn stats(&self) -> Result<StatsSnapshot, BridgeError> {
        self.call(BridgeCommand::Stats).await
    }

    /// Counters only, read without going through the loop.
    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.stats
    }

    /// Force every SIM path back to LOCAL, stop the loop and return the
    /// final statistics.
    pub async fn shutdown(&self) -> Result<StatsSnapshot, BridgeError> {
        self.call(BridgeCommand::Shutdown).await
    }
}

// ── Event loop ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Csim,
    Csq,
}

#[derive(Debug)]
struct InFlight {
    kind: RequestKind,
    deadline: Instant,
}

impl InFlight {
    fn new(kind: RequestKind) -> Self {
        Self {
            kind,
            deadline: Instant::now() + RESPONSE_TIMEOUT,
        }
    }
}

struct QueuedApdu {
    command: String,
    reply: Reply<Result<(), BridgeError>>,
}

enum LoopEvent {
    Read(Result<ReadOutcome, BridgeError>),
    Command(Option<BridgeCommand>),
    PollSignal,
    ResponseTimeout,
}

pub struct Bridge {
    channel: ModemChannel,
    paths: Vec<SimPathController>,
    monitor: SignalMonitor,
    stats: Arc<Statistics>,
    session: Box<dyn SessionHandler>,
    pending_atr: Option<Bytes>,
    lines: LineBuffer,
    in_flight: Option<InFlight>,
    queue: VecDeque<QueuedApdu>,
    commands: mpsc::Receiver<BridgeCommand>,
}

impl Bridge {
    /// Build the bridge around an already prepared channel.
    ///
    /// Must be called from within a tokio runtime when signal polling is
    /// enabled.
    pub fn new(
        config: &BridgeConfig,
        channel: ModemChannel,
        gpio: Arc<dyn Gpio>,
        session: Box<dyn SessionHandler>,
    ) -> (Self, BridgeHandle) {
        let stats = Arc::new(Statistics::new());
        let paths = config
            .setup
            .modems()
            .into_iter()
            .map(|(id, modem)| SimPathController::new(id, modem, gpio.clone(), stats.clone()))
            .collect();
        let (tx, commands) = mpsc::channel(COMMAND_QUEUE_DEPTH);

        let bridge = Self {
            channel,
            paths,
            monitor: SignalMonitor::new(config.signal_interval_secs),
            stats: stats.clone(),
            session,
            pending_atr: None,
            lines: LineBuffer::new(),
            in_flight: None,
            queue: VecDeque::new(),
            commands,
        };
        (bridge, BridgeHandle { tx, stats })
    }

    /// Run until [`BridgeHandle::shutdown`] is called or every handle is
    /// dropped. Returns the final statistics.
    pub async fn run(mut self) -> StatsSnapshot {
        tracing::info!(
            device = ?self.channel.device_path(),
            open = self.channel.is_open(),
            modems = self.paths.len(),
            "bridge started"
        );

        loop {
            let deadline = self.in_flight.as_ref().map(|f| f.deadline);
            let event = tokio::select! {
                read = self.channel.read_chunk() => LoopEvent::Read(read),
                cmd = self.commands.recv() => LoopEvent::Command(cmd),
                _ = self.monitor.tick() => LoopEvent::PollSignal,
                _ = expire(deadline) => LoopEvent::ResponseTimeout,
            };

            match event {
                LoopEvent::Read(Ok(ReadOutcome::Data(chunk))) => self.on_chunk(&chunk).await,
                LoopEvent::Read(Ok(ReadOutcome::Closed)) => {
                    tracing::warn!(device = ?self.channel.device_path(), "modem device closed");
                    self.abandon_pending();
                }
                LoopEvent::Read(Err(e)) => {
                    tracing::warn!(error = %e, "modem read failed, channel closed");
                    self.stats.record_error();
                    self.abandon_pending();
                }
                LoopEvent::Command(Some(cmd)) => {
                    if let ControlFlow::Break(snapshot) = self.handle_command(cmd).await {
                        return snapshot;
                    }
                }
                LoopEvent::Command(None) => return self.shutdown(),
                LoopEvent::PollSignal => self.poll_signal().await,
                LoopEvent::ResponseTimeout => {
                    if let Some(req) = self.in_flight.take() {
                        tracing::warn!(kind = ?req.kind, "no final result from modem, giving up");
                        self.stats.record_error();
                    }
                    self.pump_queue().await;
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: BridgeCommand) -> ControlFlow<StatsSnapshot> {
        match cmd {
            BridgeCommand::TransmitApdu { apdu, reply } => self.submit_apdu(apdu, reply).await,
            BridgeCommand::SelectPath { modem, path, reply } => {
                let result = self.controller(modem).and_then(|ctl| ctl.select(path));
                if let Err(e) = &result {
                    tracing::error!(%modem, %path, error = %e, "sim path change failed");
                }
                let _ = reply.send(result);
            }
            BridgeCommand::ResetModem { modem, reply } => {
                let result = match self.controller(modem) {
                    Ok(ctl) => ctl.reset_modem().await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            BridgeCommand::SetAtr { atr, reply } => {
                let _ = reply.send(self.set_atr(atr));
            }
            BridgeCommand::SlotStatus(status) => {
                tracing::debug!(?status, "slot status");
                self.session.on_slot_status(status);
            }
            BridgeCommand::SetSignalInterval(secs) => self.monitor.set_interval(secs),
            BridgeCommand::Stats(reply) => {
                let _ = reply.send(self.snapshot());
            }
            BridgeCommand::Shutdown(reply) => {
                let snapshot = self.shutdown();
                let _ = reply.send(snapshot.clone());
                return ControlFlow::Break(snapshot);
            }
        }
        ControlFlow::Continue(())
    }

    fn controller(&mut self, modem: ModemId) -> Result<&mut SimPathController, BridgeError> {
        self.paths
            .iter_mut()
            .find(|ctl| ctl.modem() == modem)
            .ok_or(BridgeError::NoSuchModem(modem))
    }

    fn set_atr(&mut self, atr: Bytes) -> Result<(), BridgeError> {
        if atr.len() > ATR_SIZE_MAX {
            return Err(BridgeError::AtrTooLong {
                len: atr.len(),
                max: ATR_SIZE_MAX,
            });
        }
        tracing::info!(atr = %hex::encode_upper(&atr), "ATR stored");
        self.pending_atr = Some(atr);
        Ok(())
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            atr: self.pending_atr.as_ref().map(hex::encode_upper),
            ..self.stats.snapshot()
        }
    }

    // ── AT exchange ─────────────────────────────────────────────────

    async fn submit_apdu(&mut self, apdu: Bytes, reply: Reply<Result<(), BridgeError>>) {
        if !self.channel.is_open() {
            self.stats.record_error();
            let _ = reply.send(Err(BridgeError::NotConnected));
            return;
        }
        let command = match at::encode(&apdu) {
            Ok(command) => command,
            Err(e) => {
                self.stats.record_error();
                let _ = reply.send(Err(BridgeError::Encoding(e)));
                return;
            }
        };
        tracing::debug!(apdu = %hex::encode_upper(&apdu), "card -> modem APDU");
        self.queue.push_back(QueuedApdu { command, reply });
        self.pump_queue().await;
    }

    /// Write queued APDUs while nothing is in flight.
    async fn pump_queue(&mut self) {
        while self.in_flight.is_none() {
            let Some(next) = self.queue.pop_front() else {
                break;
            };
            let result = match self.channel.send(&at::frame(&next.command)).await {
                Ok(()) => {
                    self.stats.record_sent();
                    self.in_flight = Some(InFlight::new(RequestKind::Csim));
                    Ok(())
                }
                Err(e) => {
                    tracing::warn!(error = %e, "AT+CSIM write failed");
                    self.stats.record_error();
                    Err(e)
                }
            };
            let _ = next.reply.send(result);
        }
    }

    async fn on_chunk(&mut self, chunk: &[u8]) {
        let complete = self.lines.push(chunk);
        if let Some(len) = self.lines.discard_overlong() {
            tracing::warn!(len, "discarding unterminated modem output");
            self.stats.record_error();
        }
        let Some(complete) = complete else {
            return;
        };
        let dispatched = demux::dispatch(&complete, &self.stats, self.session.as_mut());
        let Some(result) = dispatched.finals.into_iter().next() else {
            return;
        };
        match self.in_flight.take() {
            Some(req) => {
                if let FinalResult::Error(code) = &result {
                    tracing::warn!(kind = ?req.kind, %code, "modem rejected request");
                    if req.kind == RequestKind::Csim {
                        self.stats.record_error();
                    }
                }
            }
            None => tracing::debug!(?result, "final result with no request in flight"),
        }
        self.pump_queue().await;
    }

    /// Fail everything waiting on a channel that just went away.
    fn abandon_pending(&mut self) {
        self.in_flight = None;
        self.lines.clear();
        for queued in self.queue.drain(..) {
            self.stats.record_error();
            let _ = queued.reply.send(Err(BridgeError::NotConnected));
        }
    }

    async fn poll_signal(&mut self) {
        if !self.channel.is_open() {
            if self.channel.device_path().is_none() {
                return;
            }
            match self.channel.reopen() {
                Ok(()) => self.stats.record_reconnection(),
                Err(e) => {
                    tracing::debug!(error = %e, "modem still unavailable");
                    return;
                }
            }
        }
        if self.in_flight.is_some() || !self.queue.is_empty() {
            tracing::debug!("AT request outstanding, skipping signal poll");
            return;
        }
        match self.channel.send(&at::frame(at::CSQ_COMMAND)).await {
            Ok(()) => self.in_flight = Some(InFlight::new(RequestKind::Csq)),
            Err(e) => {
                tracing::warn!(error = %e, "signal poll failed");
                self.stats.record_error();
            }
        }
    }

    fn shutdown(&mut self) -> StatsSnapshot {
        for ctl in &mut self.paths {
            if let Err(e) = ctl.request_local() {
                tracing::error!(modem = %ctl.modem(), error = %e, "could not restore local SIM");
            }
        }
        self.abandon_pending();
        self.channel.close();
        let snapshot = self.snapshot();
        tracing::info!(
            tpdus_sent = snapshot.tpdus_sent,
            tpdus_received = snapshot.tpdus_received,
            errors = snapshot.errors,
            reconnections = snapshot.reconnections,
            sim_switches = snapshot.sim_switches,
            "bridge stopped"
        );
        snapshot
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    use remsim_common::models::ModemConfig;

    use super::*;
    use crate::session::SessionEvent;
    use crate::sim_path::tests::{Op, RecordingGpio, modem_config};

    struct Harness {
        handle: BridgeHandle,
        modem: UnixStream,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        gpio: Arc<RecordingGpio>,
        task: tokio::task::JoinHandle<StatsSnapshot>,
    }

    fn start(setup: ModemSetup, signal_interval_secs: i64) -> Harness {
        let (ours, modem) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let channel = ModemChannel::attach(ours, None).unwrap();
        let gpio = Arc::new(RecordingGpio::default());
        let (events_tx, events) = mpsc::unbounded_channel();
        let config = BridgeConfig {
            setup,
            signal_interval_secs,
        };
        let (bridge, handle) = Bridge::new(&config, channel, gpio.clone(), Box::new(events_tx));
        let task = tokio::spawn(bridge.run());
        Harness {
            handle,
            modem,
            events,
            gpio,
            task,
        }
    }

    fn read_command(modem: &mut UnixStream) -> String {
        let mut buf = [0u8; 256];
        let n = modem.read(&mut buf).unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[tokio::test]
    async fn apdu_round_trip_through_modem() {
        let mut h = start(ModemSetup::Single(modem_config()), 0);

        h.handle.transmit_apdu(vec![0x00, 0xB0, 0x00, 0x00, 0x02]).await.unwrap();
        assert_eq!(read_command(&mut h.modem), "AT+CSIM=10,\"00B0000002\"\r\n");

        h.modem.write_all(b"+CSIM: 8,\"12349000\"\r\nOK\r\n").unwrap();
        let event = h.events.recv().await.unwrap();
        assert_eq!(event, SessionEvent::Apdu(Bytes::from_static(&[0x12, 0x34, 0x90, 0x00])));

        let snap = h.handle.stats().await.unwrap();
        assert_eq!(snap.tpdus_sent, 1);
        assert_eq!(snap.tpdus_received, 1);
        assert_eq!(snap.errors, 0);
    }

    #[tokio::test]
    async fn response_split_across_reads_is_reassembled() {
        let mut h = start(ModemSetup::Single(modem_config()), 0);

        h.handle.transmit_apdu(vec![0x00, 0xB0, 0x00, 0x00, 0x04]).await.unwrap();
        read_command(&mut h.modem);

        h.modem.write_all(b"\r\n+CSIM: 8,\"1234").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.modem.write_all(b"9000\"\r\n\r\nOK\r\n").unwrap();

        let event = h.events.recv().await.unwrap();
        assert_eq!(
            event,
            SessionEvent::Apdu(Bytes::from_static(&[0x12, 0x34, 0x90, 0x00]))
        );
        let snap = h.handle.stats().await.unwrap();
        assert_eq!(snap.tpdus_received, 1);
        assert_eq!(snap.errors, 0);
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn second_apdu_waits_for_final_result() {
        let mut h = start(ModemSetup::Single(modem_config()), 0);

        h.handle.transmit_apdu(vec![0x01]).await.unwrap();
        let handle = h.handle.clone();
        let second = tokio::spawn(async move { handle.transmit_apdu(vec![0x02]).await });

        // The second command must not reach the modem before OK.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(read_command(&mut h.modem), "AT+CSIM=2,\"01\"\r\n");
        assert!(!second.is_finished());

        h.modem.write_all(b"+CSIM: 4,\"9000\"\r\nOK\r\n").unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(read_command(&mut h.modem), "AT+CSIM=2,\"02\"\r\n");
    }

    #[tokio::test]
    async fn unopened_channel_rejects_apdus() {
        let gpio = Arc::new(RecordingGpio::default());
        let (events_tx, _events) = mpsc::unbounded_channel();
        let config = BridgeConfig {
            setup: ModemSetup::Single(modem_config()),
            signal_interval_secs: 0,
        };
        let (bridge, handle) =
            Bridge::new(&config, ModemChannel::disabled(), gpio, Box::new(events_tx));
        tokio::spawn(bridge.run());

        assert!(matches!(
            handle.transmit_apdu(vec![0x00]).await,
            Err(BridgeError::NotConnected)
        ));
        let snap = handle.stats().await.unwrap();
        assert_eq!(snap.tpdus_sent, 0);
        assert_eq!(snap.errors, 1);
    }

    #[tokio::test]
    async fn oversized_apdu_is_an_encoding_error() {
        let h = start(ModemSetup::Single(modem_config()), 0);
        let err = h.handle.transmit_apdu(vec![0u8; at::MAX_APDU_LEN + 1]).await.unwrap_err();
        assert!(matches!(err, BridgeError::Encoding(_)));
        assert_eq!(h.handle.statistics().snapshot().errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_final_result_times_out() {
        let mut h = start(ModemSetup::Single(modem_config()), 0);
        h.handle.transmit_apdu(vec![0x01]).await.unwrap();
        read_command(&mut h.modem);

        tokio::time::sleep(RESPONSE_TIMEOUT + Duration::from_millis(10)).await;
        let snap = h.handle.stats().await.unwrap();
        assert_eq!(snap.errors, 1);

        // The queue is free again.
        h.handle.transmit_apdu(vec![0x02]).await.unwrap();
        assert_eq!(read_command(&mut h.modem), "AT+CSIM=2,\"02\"\r\n");
    }

    #[tokio::test(start_paused = true)]
    async fn signal_poll_is_skipped_while_apdu_outstanding() {
        let mut h = start(ModemSetup::Single(modem_config()), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(read_command(&mut h.modem), "AT+CSQ\r\n");
        h.modem.write_all(b"+CSQ: 31,0\r\nOK\r\n").unwrap();
        let mut signal = None;
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            signal = h.handle.statistics().signal();
            if signal.is_some() {
                break;
            }
        }
        assert_eq!(signal.map(|s| s.rssi_dbm), Some(-51));

        h.handle.transmit_apdu(vec![0xAA]).await.unwrap();
        assert_eq!(read_command(&mut h.modem), "AT+CSIM=2,\"AA\"\r\n");
        tokio::time::sleep(Duration::from_millis(1000)).await;

        h.modem.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 64];
        assert!(h.modem.read(&mut buf).is_err(), "CSQ sent while CSIM in flight");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_signal_interval_stops_polling() {
        let mut h = start(ModemSetup::Single(modem_config()), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(read_command(&mut h.modem), "AT+CSQ\r\n");
        h.modem.write_all(b"+CSQ: 20,0\r\nOK\r\n").unwrap();

        h.handle.set_signal_interval(0).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        h.modem.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 64];
        assert!(h.modem.read(&mut buf).is_err(), "AT+CSQ sent after polling was disabled");
        assert!(h.handle.statistics().signal().is_some());
    }

    #[tokio::test]
    async fn atr_is_bounded_and_reported() {
        let h = start(ModemSetup::Single(modem_config()), 0);

        h.handle.set_atr(vec![0x3B, 0x9F]).await.unwrap();
        let err = h.handle.set_atr(vec![0u8; ATR_SIZE_MAX + 1]).await.unwrap_err();
        assert!(matches!(err, BridgeError::AtrTooLong { len: 56, max: 55 }));

        let snap = h.handle.stats().await.unwrap();
        assert_eq!(snap.atr.as_deref(), Some("3B9F"));
    }

    #[tokio::test]
    async fn slot_status_reaches_session() {
        let mut h = start(ModemSetup::Single(modem_config()), 0);
        let status = SlotStatus {
            card_present: true,
            vcc_present: true,
            ..SlotStatus::default()
        };
        h.handle.slot_status(status).await.unwrap();
        assert_eq!(h.events.recv().await.unwrap(), SessionEvent::SlotStatus(status));
    }

    #[tokio::test]
    async fn dual_modem_paths_are_independent() {
        let secondary = ModemConfig {
            sim_switch_pin: 22,
            reset_pin: 23,
            device_path: None,
            is_primary: false,
        };
        let h = start(
            ModemSetup::Dual {
                primary: modem_config(),
                secondary,
            },
            0,
        );

        h.handle.request_card_insert(ModemId::Secondary).await.unwrap();
        let ops = h.gpio.ops();
        assert!(ops.contains(&Op::Value(22, true)));
        assert!(!ops.iter().any(|op| matches!(op, Op::Value(20, _))));
    }

    #[tokio::test]
    async fn unknown_modem_is_rejected() {
        let h = start(ModemSetup::Single(modem_config()), 0);
        assert!(matches!(
            h.handle.request_remote(ModemId::Secondary).await,
            Err(BridgeError::NoSuchModem(ModemId::Secondary))
        ));
    }

    #[tokio::test]
    async fn shutdown_restores_local_path() {
        let h = start(ModemSetup::Single(modem_config()), 0);
        h.handle.request_remote(ModemId::Primary).await.unwrap();

        let snap = h.handle.shutdown().await.unwrap();
        assert_eq!(snap.sim_switches, 2);
        assert_eq!(h.gpio.ops().last(), Some(&Op::Value(20, false)));
        assert_eq!(h.task.await.unwrap(), snap);
        assert!(matches!(h.handle.stats().await, Err(BridgeError::Stopped)));
    }

    #[tokio::test]
    async fn modem_close_fails_queued_apdus() {
        let mut h = start(ModemSetup::Single(modem_config()), 0);
        h.handle.transmit_apdu(vec![0x01]).await.unwrap();
        read_command(&mut h.modem);

        let handle = h.handle.clone();
        let queued = tokio::spawn(async move { handle.transmit_apdu(vec![0x02]).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(h.modem);

        assert!(matches!(queued.await.unwrap(), Err(BridgeError::NotConnected)));
        assert!(matches!(
            h.handle.transmit_apdu(vec![0x03]).await,
            Err(BridgeError::NotConnected)
        ));
    }

    #[test]
    fn script_env_names_the_device() {
        let mut config = modem_config();
        assert!(script_env(&ModemSetup::Single(config.clone())).is_empty());

        config.device_path = Some("/dev/ttyUSB2".into());
        assert_eq!(
            script_env(&ModemSetup::Single(config)),
            vec![("OPENWRT_MODEM_DEVICE".to_string(), "/dev/ttyUSB2".to_string())]
        );
    }
}
