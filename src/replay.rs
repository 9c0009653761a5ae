//! Replays a recorded notification trace through the sensor.
//!
//! The trace is a JSON lines file, one [`Notification`] per line, tagged by
//! `kind`. Empty lines and lines starting with `#` are skipped:
//!
//! ```text
//! # notepad starting on a 64 bit host
//! {"kind": "process_create", "pid": 1200, "ppid": 4, "path": "C:\\Windows\\notepad.exe"}
//! {"kind": "set_thread", "tid": 1204}
//! {"kind": "image_load", "pid": 1200, "path": "\\Windows\\System32\\ntdll.dll", "base": 140703128616960}
//! {"kind": "deliver_apcs", "tid": 1204}
//! ```
//!
//! Notifications run on a blocking worker owning the [`Sensor`], fed by the
//! async line reader through a channel. `deliver_apcs` lets the simulated
//! platform run the deferred calls queued for a thread; every transfer to
//! user mode is printed as it happens.

use std::{fmt, path::Path, sync::Arc};

use anyhow::{Context, Result};
use kestrel_core::{
    bus::EventBus,
    event::{Architecture, Event, ImageInfo, Pid, Tid},
    pdk::{Plugin, PluginContext, PluginError, PluginFactory, PluginId, Version},
    platform::{
        Platform,
        simulated::{SimulatedPlatform, UserTransfer},
    },
};
use serde::Deserialize;
use tokio::{
    fs::File,
    io::{AsyncBufRead, AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use widestring::U16String;

use crate::{
    cli::ReplayOpts,
    sensor::{NotifyError, Sensor, SensorConfig, SensorStats},
};

const CHANNEL_CAPACITY: usize = 256;

pub const PRINTER_NAME: &str = "event-printer";
const PRINTER_ID: PluginId = PluginId::from_raw(100);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    ProcessCreate {
        pid: Pid,
        ppid: Pid,
        #[serde(default = "default_architecture")]
        architecture: Architecture,
        path: String,
    },
    ProcessTerminate {
        pid: Pid,
    },
    ImageLoad {
        pid: Pid,
        path: String,
        base: u64,
        #[serde(default)]
        size: u64,
        #[serde(default)]
        is_kernel: bool,
    },
    ThreadCreate {
        pid: Pid,
        tid: Tid,
    },
    ThreadTerminate {
        pid: Pid,
        tid: Tid,
    },
    /// Raw hook message, hex encoded.
    HookMessage {
        hex: String,
    },
    /// Makes `tid` the thread raising the next notifications.
    SetThread {
        tid: Tid,
    },
    /// Runs the deferred calls queued for `tid`.
    DeliverApcs {
        tid: Tid,
    },
}

fn default_architecture() -> Architecture {
    Architecture::X64
}

/// Parses one trace line, `None` for blank lines and comments.
pub fn parse_line(line: &str) -> Result<Option<Notification>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    serde_json::from_str(line)
        .map(Some)
        .with_context(|| format!("Invalid notification {line}"))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub notifications: u64,
    pub skipped_lines: u64,
    pub rejected: u64,
    pub delivered_apcs: u64,
    pub transfers: u64,
    pub sensor: SensorStats,
}

impl fmt::Display for ReplaySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "notifications:      {}", self.notifications)?;
        writeln!(f, "skipped lines:      {}", self.skipped_lines)?;
        writeln!(f, "rejected:           {}", self.rejected)?;
        writeln!(f, "events dispatched:  {}", self.sensor.dispatched)?;
        writeln!(f, "bad notifications:  {}", self.sensor.construction_failures)?;
        writeln!(f, "bad hook messages:  {}", self.sensor.rejected_hook_messages)?;
        writeln!(f, "delivered calls:    {}", self.delivered_apcs)?;
        write!(f, "user transfers:     {}", self.transfers)
    }
}

/// Drives a [`Sensor`] running on a [`SimulatedPlatform`].
pub struct Replayer {
    sensor: Sensor,
    platform: Arc<SimulatedPlatform>,
    reported_transfers: usize,
    summary: ReplaySummary,
}

impl Replayer {
    /// Starts and arms the sensor.
    pub fn new(
        config: &SensorConfig,
        platform: Arc<SimulatedPlatform>,
        plugins: Vec<PluginFactory>,
    ) -> Result<Self> {
        let sensor = Sensor::start(config, platform.clone() as Arc<dyn Platform>, plugins)?;
        sensor.arm();
        Ok(Self {
            sensor,
            platform,
            reported_transfers: 0,
            summary: ReplaySummary::default(),
        })
    }

    pub fn sensor(&self) -> &Sensor {
        &self.sensor
    }

    pub fn apply(&mut self, notification: Notification) -> Result<(), NotifyError> {
        self.summary.notifications += 1;
        let result = self.forward(notification);
        if result.is_err() {
            self.summary.rejected += 1;
        }
        self.report_transfers();
        result
    }

    fn forward(&mut self, notification: Notification) -> Result<(), NotifyError> {
        match notification {
            Notification::ProcessCreate {
                pid,
                ppid,
                architecture,
                path,
            } => {
                let path: Vec<u16> = path.encode_utf16().collect();
                self.sensor
                    .on_process_create(pid, ppid, architecture, &path)?;
            }
            Notification::ProcessTerminate { pid } => {
                self.sensor.on_process_terminate(pid)?;
            }
            Notification::ImageLoad {
                pid,
                path,
                base,
                size,
                is_kernel,
            } => {
                let path: Vec<u16> = path.encode_utf16().collect();
                let image = ImageInfo {
                    base,
                    size,
                    is_kernel,
                };
                self.sensor.on_image_load(pid, &path, image)?;
            }
            Notification::ThreadCreate { pid, tid } => {
                self.sensor.on_thread_create(pid, tid)?;
            }
            Notification::ThreadTerminate { pid, tid } => {
                self.sensor.on_thread_terminate(pid, tid)?;
            }
            Notification::HookMessage { hex: encoded } => match hex::decode(encoded.trim()) {
                Ok(message) => {
                    self.sensor.on_um_hook_message(&message)?;
                }
                Err(err) => {
                    log::warn!("skipping hook message: {err}");
                    self.summary.skipped_lines += 1;
                }
            },
            Notification::SetThread { tid } => self.platform.set_current_thread(tid),
            Notification::DeliverApcs { tid } => {
                let delivered = self.platform.deliver_all(tid);
                log::debug!("delivered {delivered} calls on thread {tid}");
                self.summary.delivered_apcs += delivered as u64;
            }
        }
        Ok(())
    }

    fn report_transfers(&mut self) {
        let transfers = self.platform.transfers();
        for transfer in transfers.iter().skip(self.reported_transfers) {
            println!("{}", TransferLine(transfer));
        }
        self.summary.transfers = transfers.len() as u64;
        self.reported_transfers = transfers.len();
    }

    /// Stops the sensor and returns what happened.
    pub fn finish(mut self) -> ReplaySummary {
        self.sensor.stop();
        self.report_transfers();
        ReplaySummary {
            sensor: self.sensor.stats(),
            ..self.summary
        }
    }
}

struct TransferLine<'a>(&'a UserTransfer);

impl fmt::Display for TransferLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let transfer = self.0;
        write!(
            f,
            "[TRANSFER {}] {:?} routine {:#x} context {:#x}",
            transfer.thread,
            transfer.personality,
            transfer.routine.entry,
            transfer.routine.context
        )?;
        if let Some(bytes) = &transfer.context_bytes {
            write!(f, " \"{}\"", utf16_until_nul(bytes).to_string_lossy())?;
        }
        Ok(())
    }
}

/// Decodes the little endian, NUL terminated string at the start of `bytes`.
fn utf16_until_nul(bytes: &[u8]) -> U16String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|unit| *unit != 0)
        .collect();
    U16String::from_vec(units)
}

/// Plugin printing every event on standard output.
pub fn printer() -> PluginFactory {
    PluginFactory::new(
        PRINTER_NAME,
        Version::parse(env!("CARGO_PKG_VERSION")).unwrap(),
        true,
        |_ctx: &PluginContext| Ok(EventPrinter),
    )
}

pub struct EventPrinter;

impl Plugin for EventPrinter {
    fn id(&self) -> PluginId {
        PRINTER_ID
    }

    fn name(&self) -> &str {
        PRINTER_NAME
    }

    fn on_event(&self, event: &Event<'_>, _bus: &EventBus) -> Result<(), PluginError> {
        println!("{event:#}");
        Ok(())
    }
}

/// Builds the simulated platform described by the command line.
pub fn platform(options: &ReplayOpts) -> Arc<SimulatedPlatform> {
    let platform = Arc::new(SimulatedPlatform::new());
    platform.enable_synthetic_exports();
    platform.set_os_version(options.os_version);
    for pid in &options.wow64 {
        platform.set_wow64(Pid::from_raw(*pid));
    }
    for pid in &options.protected {
        platform.set_protected(Pid::from_raw(*pid));
    }
    platform
}

/// Replays the trace selected by `options` through `plugins`.
pub async fn run(options: &ReplayOpts, mut plugins: Vec<PluginFactory>) -> Result<ReplaySummary> {
    let config = match &options.config_file {
        Some(config_file) => SensorConfig::with_custom_file(config_file)?,
        None => SensorConfig::default(),
    };
    if options.print_events {
        plugins.insert(0, printer());
    }

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &options.trace {
        Some(path) => Box::new(open_trace(path).await?),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let replayer = Replayer::new(&config, platform(options), plugins)?;
    let (tx, mut rx) = mpsc::channel::<Notification>(CHANNEL_CAPACITY);

    let worker = tokio::task::spawn_blocking(move || {
        let mut replayer = replayer;
        while let Some(notification) = rx.blocking_recv() {
            if let Err(err) = replayer.apply(notification) {
                log::warn!("notification rejected: {err}");
            }
        }
        replayer.finish()
    });

    let mut skipped_lines = 0;
    let mut lines = reader.lines();
    let mut line_number = 0usize;
    while let Some(line) = lines.next_line().await.context("Error reading trace")? {
        line_number += 1;
        match parse_line(&line) {
            Ok(Some(notification)) => {
                if tx.send(notification).await.is_err() {
                    log::error!("replay worker exited early");
                    break;
                }
            }
            Ok(None) => {}
            Err(err) => {
                log::warn!("line {line_number}: {err:#}");
                skipped_lines += 1;
            }
        }
    }
    drop(tx);

    let mut summary = worker.await.context("Replay worker failed")?;
    summary.skipped_lines += skipped_lines;
    Ok(summary)
}

async fn open_trace(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path)
        .await
        .with_context(|| format!("Error opening trace {}", path.display()))?;
    Ok(BufReader::new(file))
}

#[cfg(test)]
mod tests {
    use kestrel_core::platform::simulated::SYNTHETIC_EXPORT_OFFSET;

    use super::*;

    const NOTEPAD: Pid = Pid::from_raw(1200);
    const LOADING_THREAD: Tid = Tid::from_raw(1204);
    const NTDLL_BASE: u64 = 0x7ff8_0000_0000;

    fn replayer(plugins: Vec<PluginFactory>) -> (Replayer, Arc<SimulatedPlatform>) {
        let options = crate::cli::parse_from([crate::cli::NAME].into_iter());
        let platform = platform(&options);
        let replayer = Replayer::new(&SensorConfig::default(), platform.clone(), plugins).unwrap();
        (replayer, platform)
    }

    fn trace(text: &str) -> Vec<Notification> {
        text.lines()
            .filter_map(|line| parse_line(line).unwrap())
            .collect()
    }

    #[test]
    fn parse_notifications() {
        let notifications = trace(
            r#"
            # comment
            {"kind": "process_create", "pid": 10, "ppid": 4, "path": "C:\\a.exe"}
            {"kind": "image_load", "pid": 10, "path": "\\x.dll", "base": 4096}
            {"kind": "deliver_apcs", "tid": 7}
            "#,
        );

        assert_eq!(
            notifications,
            vec![
                Notification::ProcessCreate {
                    pid: Pid::from_raw(10),
                    ppid: Pid::from_raw(4),
                    architecture: Architecture::X64,
                    path: r"C:\a.exe".to_string(),
                },
                Notification::ImageLoad {
                    pid: Pid::from_raw(10),
                    path: r"\x.dll".to_string(),
                    base: 4096,
                    size: 0,
                    is_kernel: false,
                },
                Notification::DeliverApcs {
                    tid: Tid::from_raw(7)
                },
            ]
        );
    }

    #[test]
    fn invalid_lines() {
        assert!(parse_line(r#"{"kind": "reboot"}"#).is_err());
        assert!(parse_line(r#"{"kind": "process_terminate"}"#).is_err());
        assert!(parse_line("not json").is_err());
        assert!(parse_line("   ").unwrap().is_none());
    }

    #[cfg(feature = "injector")]
    #[test]
    fn injection_is_replayed() {
        let (mut replayer, platform) = replayer(crate::plugins());

        for notification in trace(&format!(
            r#"
            {{"kind": "process_create", "pid": {NOTEPAD}, "ppid": 4, "path": "C:\\Windows\\notepad.exe"}}
            {{"kind": "set_thread", "tid": {LOADING_THREAD}}}
            {{"kind": "image_load", "pid": {NOTEPAD}, "path": "\\Windows\\System32\\ntdll.dll", "base": {NTDLL_BASE}}}
            {{"kind": "deliver_apcs", "tid": {LOADING_THREAD}}}
            "#
        )) {
            replayer.apply(notification).unwrap();
        }

        let transfers = platform.transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].thread, LOADING_THREAD);
        assert_eq!(
            transfers[0].routine.entry,
            NTDLL_BASE + SYNTHETIC_EXPORT_OFFSET
        );

        let summary = replayer.finish();
        assert_eq!(summary.notifications, 4);
        assert_eq!(summary.delivered_apcs, 2);
        assert_eq!(summary.transfers, 1);
        assert_eq!(summary.sensor.dispatched, 2);
    }

    #[test]
    fn rejected_notifications_are_counted() {
        let (mut replayer, _) = replayer(Vec::new());

        let result = replayer.apply(Notification::HookMessage {
            hex: "00010203".to_string(),
        });
        assert!(matches!(result, Err(NotifyError::Hook(_))));

        let bad_hex = replayer.apply(Notification::HookMessage {
            hex: "zz".to_string(),
        });
        assert!(bad_hex.is_ok());

        let summary = replayer.finish();
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.skipped_lines, 1);
        assert_eq!(summary.sensor.rejected_hook_messages, 1);
    }

    #[test]
    fn printer_sees_every_event() {
        let (mut replayer, _) = replayer(vec![printer()]);
        replayer
            .apply(Notification::ThreadCreate {
                pid: NOTEPAD,
                tid: LOADING_THREAD,
            })
            .unwrap();

        assert_eq!(replayer.sensor().bus().len(), 1);
        assert_eq!(replayer.finish().sensor.dispatched, 1);
    }

    #[test]
    fn context_path_decoding() {
        let mut bytes: Vec<u8> = "C:\\hk.dll"
            .encode_utf16()
            .flat_map(u16::to_le_bytes)
            .collect();
        bytes.extend([0, 0, 0x41, 0]);

        assert_eq!(utf16_until_nul(&bytes).to_string_lossy(), "C:\\hk.dll");
    }

    #[tokio::test]
    async fn missing_trace_file() {
        let mut options = crate::cli::parse_from([crate::cli::NAME].into_iter());
        options.trace = Some("/nonexistent/trace.jsonl".into());

        assert!(run(&options, Vec::new()).await.is_err());
    }
}
