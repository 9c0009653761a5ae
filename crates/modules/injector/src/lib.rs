//! Injects the sensor hook library into user processes.
//!
//! A process is tracked from its creation until every system image the loader
//! needs is mapped. The image-load notification that completes the set starts
//! the [injection hop](hop), which queues the loader routine of the process'
//! ntdll on the loading thread.
//!
//! Configuration (`[injector]` section):
//!
//! | key               | default                                |
//! |-------------------|----------------------------------------|
//! | `dll_path_native` | `C:\Windows\System32\kestrelhk.dll`    |
//! | `dll_path_wow64`  | `C:\Windows\SysWOW64\kestrelhk.dll`    |
//! | `loader_routine`  | `LdrLoadDll`                           |

use std::sync::Arc;

use kestrel_core::{
    bus::EventBus,
    deferred::{DeferredCallQueue, DeferredError, Personality, QueueStats},
    event::{Event, ImageInfo, Pid, Payload},
    pdk::{
        ConfigError, ModuleConfig, Plugin, PluginContext, PluginError, PluginFactory, PluginId,
        Version,
    },
    platform::Platform,
};
use widestring::{U16Str, U16String};

pub mod dlls;
pub mod hop;
pub mod table;

use dlls::SystemDll;
use hop::InjectionTarget;
use table::{InjectionRecord, InjectionTable};

pub const PLUGIN_NAME: &str = "injector";
pub const PLUGIN_ID: PluginId = PluginId::from_raw(1);

pub fn plugin() -> PluginFactory {
    PluginFactory::new(
        PLUGIN_NAME,
        Version::parse(env!("CARGO_PKG_VERSION")).unwrap(),
        true,
        Injector::new,
    )
}

#[derive(Debug, Clone)]
pub struct Config {
    pub dll_path_native: U16String,
    pub dll_path_wow64: U16String,
    pub loader_routine: String,
}

impl TryFrom<&ModuleConfig> for Config {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        let dll_path_native: String = config.with_default(
            "dll_path_native",
            r"C:\Windows\System32\kestrelhk.dll".to_string(),
        )?;
        let dll_path_wow64: String = config.with_default(
            "dll_path_wow64",
            r"C:\Windows\SysWOW64\kestrelhk.dll".to_string(),
        )?;
        let loader_routine: String = config.with_default("loader_routine", "LdrLoadDll".to_string())?;
        if loader_routine.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "loader_routine".to_string(),
                value: loader_routine,
                err: "export name cannot be empty".to_string(),
            });
        }

        Ok(Self {
            dll_path_native: U16String::from_str(&dll_path_native),
            dll_path_wow64: U16String::from_str(&dll_path_wow64),
            loader_routine,
        })
    }
}

pub struct Injector {
    config: Config,
    platform: Arc<dyn Platform>,
    table: InjectionTable,
    queue: DeferredCallQueue,
}

impl Injector {
    pub fn new(ctx: &PluginContext) -> Result<Self, PluginError> {
        let config = Config::try_from(ctx.config())?;
        log::debug!(target: ctx.plugin_name(), "loader routine {}", config.loader_routine);
        let platform = ctx.platform();
        Ok(Self {
            config,
            queue: DeferredCallQueue::new(platform.clone()),
            platform,
            table: InjectionTable::new(),
        })
    }

    /// Current injection progress of `pid`, if tracked.
    pub fn record(&self, pid: Pid) -> Option<InjectionRecord> {
        self.table.get(pid)
    }

    /// Number of tracked processes.
    pub fn tracked(&self) -> usize {
        self.table.len()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    fn on_process_create(&self, pid: Pid) {
        if self.platform.is_protected(pid) {
            log::debug!(target: PLUGIN_NAME, "skipping protected process {pid}");
            // A previous process with the same pid is gone.
            self.table.remove(pid);
            return;
        }

        let personality = if self.platform.is_wow64(pid) {
            Personality::Wow64
        } else {
            Personality::Native
        };
        let dll_path = match personality {
            Personality::Native => self.config.dll_path_native.clone(),
            Personality::Wow64 => self.config.dll_path_wow64.clone(),
        };
        let required = SystemDll::required(personality, self.platform.os_version());

        let record = InjectionRecord::new(pid, personality, required, dll_path);
        if self.table.insert(record).is_some() {
            log::debug!(target: PLUGIN_NAME, "process {pid} tracked again, previous record dropped");
        }
    }

    fn on_image_load(&self, pid: Pid, image_path: &U16Str, image: &ImageInfo) {
        if image.is_kernel {
            return;
        }
        let dll = SystemDll::from_path(image_path);
        if dll.is_empty() {
            return;
        }

        let loader_routine = self.config.loader_routine.as_str();
        let ready = self.table.image_loaded(pid, dll, image.base, |base| {
            self.platform.resolve_export(base, loader_routine)
        });
        if let Some(record) = ready {
            self.inject(record);
        }
    }

    fn inject(&self, record: InjectionRecord) {
        let pid = record.pid;
        let Some(target) = InjectionTarget::from_record(record) else {
            log::warn!(
                target: PLUGIN_NAME,
                "process {pid} not injected: {} not resolved",
                self.config.loader_routine
            );
            return;
        };

        match hop::start(&self.queue.handle(), &self.platform, target) {
            Ok(key) => log::debug!(target: PLUGIN_NAME, "process {pid} injection scheduled as {key}"),
            Err(DeferredError::TooLate) => {
                log::debug!(target: PLUGIN_NAME, "process {pid} not injected: shutting down")
            }
            Err(err) => log::warn!(target: PLUGIN_NAME, "process {pid} not injected: {err}"),
        }
    }
}

impl Plugin for Injector {
    fn id(&self) -> PluginId {
        PLUGIN_ID
    }

    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn on_event(&self, event: &Event<'_>, _bus: &EventBus) -> Result<(), PluginError> {
        match event.payload() {
            Payload::ProcessCreate { pid, .. } => self.on_process_create(*pid),
            Payload::ImageLoad {
                pid,
                image_path,
                image,
            } => self.on_image_load(*pid, image_path, image),
            Payload::ProcessTerminate { pid } => {
                self.table.remove(*pid);
            }
            _ => {}
        }
        Ok(())
    }

    fn shutdown(&self) {
        let report = self.queue.shutdown();
        log::info!(
            target: PLUGIN_NAME,
            "stopped: {} injections cancelled, {} awaited, {} processes still tracked",
            report.cancelled,
            report.awaited,
            self.table.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use kestrel_core::{
        event::{Architecture, Tid},
        pdk::{PluginName, process_cache::ProcessCache},
        platform::{
            OsVersion,
            simulated::{FailPoint, SYNTHETIC_EXPORT_OFFSET, SimulatedPlatform},
        },
    };

    use super::*;

    const PID: Pid = Pid::from_raw(4242);
    const THREAD: Tid = Tid::from_raw(77);
    const NTDLL_BASE: u64 = 0x7ff8_4000_0000;
    const WOW_NTDLL_BASE: u64 = 0x7700_0000;

    struct Fixture {
        platform: Arc<SimulatedPlatform>,
        injector: Arc<Injector>,
        bus: EventBus,
    }

    fn fixture_with(config: ModuleConfig) -> Fixture {
        let platform = Arc::new(SimulatedPlatform::new());
        platform.set_current_thread(THREAD);
        platform.enable_synthetic_exports();
        let ctx = PluginContext::new(
            PluginName::from(PLUGIN_NAME),
            config,
            platform.clone(),
            ProcessCache::new(),
        );
        let injector = Arc::new(Injector::new(&ctx).unwrap());
        let mut builder = EventBus::builder();
        builder.register(injector.clone()).unwrap();
        Fixture {
            platform,
            injector,
            bus: builder.build(),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(ModuleConfig::default())
    }

    impl Fixture {
        fn create(&self, pid: Pid) {
            let path: Vec<u16> = r"C:\Windows\System32\notepad.exe".encode_utf16().collect();
            let event = Event::process_create(pid, Pid::from_raw(4), Architecture::X64, &path);
            assert!(self.bus.dispatch(&event.unwrap()).is_success());
        }

        fn load(&self, pid: Pid, path: &str, base: u64) {
            let path: Vec<u16> = path.encode_utf16().collect();
            let image = ImageInfo {
                base,
                size: 0x1000,
                is_kernel: false,
            };
            let event = Event::image_load(pid, &path, image).unwrap();
            assert!(self.bus.dispatch(&event).is_success());
        }

        fn terminate(&self, pid: Pid) {
            self.bus.dispatch(&Event::process_terminate(pid));
        }
    }

    #[test]
    fn native_process_injected_once_ntdll_is_mapped() {
        let f = fixture();
        f.create(PID);
        assert_eq!(f.injector.tracked(), 1);

        f.load(PID, r"\Device\HarddiskVolume2\Windows\System32\ntdll.dll", NTDLL_BASE);

        assert!(f.injector.record(PID).is_none());
        assert_eq!(f.platform.pending_apcs(THREAD), 1);
        assert_eq!(f.platform.deliver_all(THREAD), 2);

        let transfers = f.platform.transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].routine.entry, NTDLL_BASE + SYNTHETIC_EXPORT_OFFSET);
        assert_eq!(transfers[0].personality, Personality::Native);
        let path: Vec<u8> = r"C:\Windows\System32\kestrelhk.dll"
            .encode_utf16()
            .chain([0])
            .flat_map(u16::to_le_bytes)
            .collect();
        assert!(transfers[0].context_bytes.as_ref().unwrap().starts_with(&path));
    }

    #[test]
    fn unrelated_images_leave_record_unchanged() {
        let f = fixture();
        f.create(PID);
        let before = f.injector.record(PID).unwrap();

        f.load(PID, r"C:\Windows\System32\user32.dll", 0x1000);
        f.load(PID, r"C:\Windows\SysWOW64\ntdll.dll", WOW_NTDLL_BASE);

        assert_eq!(f.injector.record(PID).unwrap(), before);
        assert_eq!(f.platform.pending_apcs(THREAD), 0);
    }

    #[test]
    fn injected_exactly_once() {
        let f = fixture();
        f.create(PID);
        f.load(PID, r"C:\Windows\System32\ntdll.dll", NTDLL_BASE);
        f.load(PID, r"C:\Windows\System32\ntdll.dll", NTDLL_BASE);
        f.platform.deliver_all(THREAD);

        assert_eq!(f.platform.transfers().len(), 1);
        assert_eq!(f.injector.queue_stats().executed, 2);
    }

    #[test]
    fn wow64_process_waits_for_full_set() {
        let f = fixture();
        f.platform.set_wow64(PID);
        f.create(PID);

        f.load(PID, r"C:\Windows\System32\ntdll.dll", NTDLL_BASE);
        f.load(PID, r"C:\Windows\System32\wow64.dll", 0x10_0000);
        f.load(PID, r"C:\Windows\System32\wow64win.dll", 0x20_0000);
        f.load(PID, r"C:\Windows\SysWOW64\ntdll.dll", WOW_NTDLL_BASE);

        let record = f.injector.record(PID).unwrap();
        assert_eq!(record.personality, Personality::Wow64);
        assert_eq!(record.loader_routine, Some(WOW_NTDLL_BASE + SYNTHETIC_EXPORT_OFFSET));
        assert!(!record.is_ready());
        assert_eq!(f.platform.pending_apcs(THREAD), 0);

        f.load(PID, r"C:\Windows\System32\WOW64CPU.DLL", 0x30_0000);
        assert!(f.injector.record(PID).is_none());
        f.platform.deliver_all(THREAD);

        let transfer = f.platform.transfers().pop().unwrap();
        assert_eq!(transfer.personality, Personality::Wow64);
        assert_eq!(
            transfer.routine.entry,
            SimulatedPlatform::wow64_encode(WOW_NTDLL_BASE + SYNTHETIC_EXPORT_OFFSET)
        );
        let path: Vec<u8> = r"C:\Windows\SysWOW64\kestrelhk.dll"
            .encode_utf16()
            .flat_map(u16::to_le_bytes)
            .collect();
        assert!(transfer.context_bytes.unwrap().starts_with(&path));
    }

    #[test]
    fn windows7_needs_kernel32_and_kernelbase() {
        let f = fixture();
        f.platform.set_os_version(OsVersion::WINDOWS_7);
        f.create(PID);

        f.load(PID, r"C:\Windows\System32\ntdll.dll", NTDLL_BASE);
        f.load(PID, r"C:\Windows\System32\kernel32.dll", 0x10_0000);
        assert!(f.injector.record(PID).is_some());

        f.load(PID, r"C:\Windows\System32\KernelBase.dll", 0x20_0000);
        assert!(f.injector.record(PID).is_none());
        assert_eq!(f.platform.pending_apcs(THREAD), 1);
    }

    #[test]
    fn protected_processes_are_skipped() {
        let f = fixture();
        f.platform.set_protected(PID);
        f.create(PID);

        assert!(f.injector.record(PID).is_none());
        f.load(PID, r"C:\Windows\System32\ntdll.dll", NTDLL_BASE);
        assert_eq!(f.platform.pending_apcs(THREAD), 0);
    }

    #[test]
    fn pid_reuse_resets_tracking() {
        let f = fixture();
        f.platform.set_wow64(PID);
        f.create(PID);
        f.load(PID, r"C:\Windows\System32\wow64.dll", 0x10_0000);
        assert!(!f.injector.record(PID).unwrap().loaded.is_empty());

        // The terminate notification of the first process was never seen.
        f.create(PID);

        let record = f.injector.record(PID).unwrap();
        assert!(record.loaded.is_empty());
        assert_eq!(record.loader_routine, None);
        assert_eq!(f.injector.tracked(), 1);
    }

    #[test]
    fn record_present_until_terminate() {
        let f = fixture();
        f.create(PID);
        f.load(PID, r"C:\Windows\System32\user32.dll", 0x1000);
        assert!(f.injector.record(PID).is_some());

        f.terminate(PID);
        assert!(f.injector.record(PID).is_none());
        assert_eq!(f.injector.tracked(), 0);
    }

    #[test]
    fn kernel_images_are_ignored() {
        let f = fixture();
        f.create(PID);
        let path: Vec<u16> = r"C:\Windows\System32\ntdll.dll".encode_utf16().collect();
        let image = ImageInfo {
            base: NTDLL_BASE,
            size: 0x1000,
            is_kernel: true,
        };
        f.bus
            .dispatch(&Event::image_load(PID, &path, image).unwrap());

        assert!(f.injector.record(PID).is_some());
    }

    #[test]
    fn unresolved_loader_routine_drops_record() {
        // Synthetic exports stay off, only LdrLoadDll resolves.
        let platform = Arc::new(SimulatedPlatform::new());
        platform.add_export(NTDLL_BASE, "LdrLoadDll", NTDLL_BASE + 0x10);
        let ctx = PluginContext::new(
            PluginName::from(PLUGIN_NAME),
            [("loader_routine", "NoSuchExport")].into_iter().collect(),
            platform.clone(),
            ProcessCache::new(),
        );
        let injector = Injector::new(&ctx).unwrap();
        let ntdll: Vec<u16> = r"C:\Windows\System32\ntdll.dll".encode_utf16().collect();

        injector.on_process_create(PID);
        injector.on_image_load(
            PID,
            U16Str::from_slice(&ntdll),
            &ImageInfo {
                base: NTDLL_BASE,
                size: 0x1000,
                is_kernel: false,
            },
        );

        assert_eq!(injector.tracked(), 0);
        assert_eq!(platform.pending_apcs(platform.current_thread()), 0);
        assert_eq!(injector.queue_stats().scheduled, 0);
    }

    #[test]
    fn failed_hop_leaks_nothing() {
        let f = fixture();
        f.platform.fail_on(FailPoint::WriteView);
        f.create(PID);
        f.load(PID, r"C:\Windows\System32\ntdll.dll", NTDLL_BASE);
        f.platform.deliver_all(THREAD);

        assert!(f.platform.transfers().is_empty());
        assert_eq!(f.platform.open_sections(), 0);
        assert_eq!(f.platform.mapped_views(), 0);
    }

    #[test]
    fn shutdown_cancels_undelivered_injections() {
        let f = fixture();
        f.create(PID);
        f.load(PID, r"C:\Windows\System32\ntdll.dll", NTDLL_BASE);
        assert_eq!(f.platform.pending_apcs(THREAD), 1);

        f.bus.shutdown();

        assert_eq!(f.platform.pending_apcs(THREAD), 0);
        assert_eq!(f.injector.queue_stats().cancelled, 1);

        // Later notifications are accepted but schedule nothing.
        f.create(Pid::from_raw(1));
        f.load(Pid::from_raw(1), r"C:\Windows\System32\ntdll.dll", NTDLL_BASE);
        assert_eq!(f.platform.pending_apcs(THREAD), 0);
    }

    #[test]
    fn configured_path_is_written() {
        let f = fixture_with([("dll_path_native", r"D:\hk\custom.dll")].into_iter().collect());
        f.create(PID);
        f.load(PID, r"C:\Windows\System32\ntdll.dll", NTDLL_BASE);
        f.platform.deliver_all(THREAD);

        let path: Vec<u8> = r"D:\hk\custom.dll"
            .encode_utf16()
            .chain([0])
            .flat_map(u16::to_le_bytes)
            .collect();
        let transfer = f.platform.transfers().pop().unwrap();
        assert!(transfer.context_bytes.unwrap().starts_with(&path));
    }

    #[test]
    fn config_defaults_and_validation() {
        let config = Config::try_from(&ModuleConfig::default()).unwrap();
        assert_eq!(config.loader_routine, "LdrLoadDll");
        assert_eq!(
            config.dll_path_wow64.to_string_lossy(),
            r"C:\Windows\SysWOW64\kestrelhk.dll"
        );

        let empty: ModuleConfig = [("loader_routine", "")].into_iter().collect();
        assert!(Config::try_from(&empty).is_err());
    }
}
