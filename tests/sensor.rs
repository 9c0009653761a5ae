use std::{
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use kestrel::sensor::{NotifyError, Phase, Sensor, SensorConfig};
use kestrel_core::{
    bus::EventBus,
    event::{Architecture, Event, ImageInfo, Payload, Pid, Tid},
    hook::encode_rpc_message,
    pdk::{
        Plugin, PluginContext, PluginError, PluginFactory, PluginId, Version,
        process_cache::ProcessCache,
    },
    platform::{
        Platform,
        simulated::{SYNTHETIC_EXPORT_OFFSET, SimulatedPlatform},
    },
};
use uguid::guid;

const NOTEPAD: Pid = Pid::from_raw(1200);
const LOADING_THREAD: Tid = Tid::from_raw(1204);
const NTDLL_BASE: u64 = 0x7ff8_0000_0000;

fn utf16(text: &str) -> Vec<u16> {
    text.encode_utf16().collect()
}

/// Records, for every process event, whether the process was in the cache.
struct CacheProbe {
    cache: ProcessCache,
    seen: Arc<Mutex<Vec<(String, bool)>>>,
}

impl Plugin for CacheProbe {
    fn id(&self) -> PluginId {
        PluginId::from_raw(50)
    }

    fn name(&self) -> &str {
        "cache-probe"
    }

    fn on_event(&self, event: &Event<'_>, _bus: &EventBus) -> Result<(), PluginError> {
        let kind = match event.payload() {
            Payload::ProcessCreate { .. } => "create",
            Payload::ProcessTerminate { .. } => "terminate",
            _ => return Ok(()),
        };
        let cached = event
            .pid()
            .map(|pid| self.cache.get(pid).is_ok())
            .unwrap_or_default();
        self.seen.lock().unwrap().push((kind.to_string(), cached));
        Ok(())
    }
}

fn probe(seen: Arc<Mutex<Vec<(String, bool)>>>) -> PluginFactory {
    PluginFactory::new("cache-probe", Version::new(0, 1, 0), true, move |ctx: &PluginContext| {
        Ok(CacheProbe {
            cache: ctx.process_cache(),
            seen: seen.clone(),
        })
    })
}

fn start(config: &SensorConfig, plugins: Vec<PluginFactory>) -> (Sensor, Arc<SimulatedPlatform>) {
    let platform = Arc::new(SimulatedPlatform::new());
    platform.enable_synthetic_exports();
    let sensor = Sensor::start(config, platform.clone() as Arc<dyn Platform>, plugins).unwrap();
    (sensor, platform)
}

#[test]
fn process_is_cached_for_its_whole_lifetime() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (sensor, _) = start(&SensorConfig::default(), vec![probe(seen.clone())]);
    sensor.arm();

    let mut path = utf16(r"C:\Ünïcødé\notepad.exe");
    path.push(0xD800);
    sensor
        .on_process_create(NOTEPAD, Pid::from_raw(4), Architecture::X64, &path)
        .unwrap();
    let info = sensor.process_cache().get(NOTEPAD).unwrap();
    assert_eq!(info.ppid, Pid::from_raw(4));
    assert_eq!(info.image.as_slice(), path.as_slice());

    sensor.on_process_terminate(NOTEPAD).unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![("create".to_string(), true), ("terminate".to_string(), true)]
    );
    assert!(sensor.process_cache().get(NOTEPAD).is_err());
}

#[test]
fn malformed_hook_message_reaches_no_plugin() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (sensor, _) = start(&SensorConfig::default(), vec![probe(seen)]);
    sensor.arm();

    let mut message = encode_rpc_message(guid!("12345778-1234-abcd-ef00-0123456789ac"), 1, 0, &[]);
    message[0] ^= 0xff;

    let result = sensor.on_um_hook_message(&message);

    assert!(matches!(result, Err(NotifyError::Hook(_))));
    let stats = sensor.stats();
    assert_eq!(stats.dispatched, 0);
    assert_eq!(stats.rejected_hook_messages, 1);
}

#[test]
fn thread_notifications_wait_for_arm() {
    let (sensor, _) = start(&SensorConfig::default(), Vec::new());
    let sensor = Arc::new(sensor);

    let waiter = {
        let sensor = sensor.clone();
        thread::spawn(move || sensor.on_thread_create(NOTEPAD, LOADING_THREAD))
    };
    thread::sleep(Duration::from_millis(50));
    assert_eq!(sensor.stats().dispatched, 0);

    sensor.arm();

    assert!(waiter.join().unwrap().unwrap().is_success());
    assert_eq!(sensor.stats().dispatched, 1);
}

#[test]
fn thread_notifications_are_released_by_stop() {
    let (sensor, _) = start(&SensorConfig::default(), Vec::new());
    let sensor = Arc::new(sensor);

    let waiter = {
        let sensor = sensor.clone();
        thread::spawn(move || sensor.on_thread_terminate(NOTEPAD, LOADING_THREAD))
    };
    thread::sleep(Duration::from_millis(20));
    sensor.stop();

    assert!(matches!(waiter.join().unwrap(), Err(NotifyError::Stopped)));
    assert_eq!(sensor.stats().dispatched, 0);
}

#[test]
fn notifications_after_stop_are_refused() {
    let (sensor, _) = start(&SensorConfig::default(), Vec::new());
    sensor.arm();
    sensor.stop();
    sensor.stop();

    assert_eq!(sensor.phase(), Phase::Stopped);
    assert!(matches!(
        sensor.on_process_terminate(NOTEPAD),
        Err(NotifyError::Stopped)
    ));
    assert!(matches!(
        sensor.on_thread_create(NOTEPAD, LOADING_THREAD),
        Err(NotifyError::Stopped)
    ));
}

#[cfg(feature = "injector")]
#[test]
fn notepad_is_injected() {
    let (sensor, platform) = start(&SensorConfig::default(), kestrel::plugins());
    sensor.arm();
    platform.set_current_thread(LOADING_THREAD);

    sensor
        .on_process_create(
            NOTEPAD,
            Pid::from_raw(4),
            Architecture::X64,
            &utf16(r"C:\Windows\System32\notepad.exe"),
        )
        .unwrap();
    let image = ImageInfo {
        base: NTDLL_BASE,
        size: 0x1f_0000,
        is_kernel: false,
    };
    sensor
        .on_image_load(NOTEPAD, &utf16(r"\Windows\System32\ntdll.dll"), image)
        .unwrap();
    assert_eq!(platform.deliver_all(LOADING_THREAD), 2);

    let transfers = platform.transfers();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].thread, LOADING_THREAD);
    assert_eq!(transfers[0].routine.entry, NTDLL_BASE + SYNTHETIC_EXPORT_OFFSET);
    let path: Vec<u8> = utf16(r"C:\Windows\System32\kestrelhk.dll")
        .into_iter()
        .flat_map(u16::to_le_bytes)
        .collect();
    assert!(
        transfers[0]
            .context_bytes
            .as_ref()
            .unwrap()
            .starts_with(&path)
    );
    assert_eq!(platform.open_sections(), 0);
}

#[cfg(feature = "injector")]
#[test]
fn configured_library_path_is_mapped_verbatim() {
    let config =
        SensorConfig::from_ini_str("[injector]\ndll_path_native = C:\\Windows\\System32\\nthook.dll\n")
            .unwrap();
    let (sensor, platform) = start(&config, kestrel::plugins());
    sensor.arm();
    platform.set_current_thread(LOADING_THREAD);

    sensor
        .on_process_create(NOTEPAD, Pid::from_raw(4), Architecture::X64, &utf16(r"C:\notepad.exe"))
        .unwrap();
    let image = ImageInfo {
        base: NTDLL_BASE,
        size: 0x1f_0000,
        is_kernel: false,
    };
    sensor
        .on_image_load(NOTEPAD, &utf16(r"\Windows\System32\ntdll.dll"), image)
        .unwrap();
    platform.deliver_all(LOADING_THREAD);

    let transfers = platform.transfers();
    assert_eq!(transfers.len(), 1);
    let mut expected: Vec<u8> = utf16(r"C:\Windows\System32\nthook.dll")
        .into_iter()
        .flat_map(u16::to_le_bytes)
        .collect();
    expected.extend([0, 0]);
    let view = transfers[0].context_bytes.as_ref().unwrap();
    assert_eq!(&view[..expected.len()], expected.as_slice());
}

#[test]
fn plugins_are_built_with_their_own_section() {
    let config =
        SensorConfig::from_ini_str("[kestrel]\nmode = test\n[labelled]\nlabel = first\n").unwrap();
    let built = Arc::new(Mutex::new(Vec::new()));
    let factory = {
        let built = built.clone();
        PluginFactory::new("labelled", Version::new(0, 1, 0), true, move |ctx: &PluginContext| {
            built.lock().unwrap().push((
                ctx.plugin_name().to_string(),
                ctx.config().get_raw("label").map(str::to_string),
            ));
            Ok(CacheProbe {
                cache: ctx.process_cache(),
                seen: Arc::new(Mutex::new(Vec::new())),
            })
        })
    };

    let (_sensor, _) = start(&config, vec![factory]);

    assert_eq!(
        *built.lock().unwrap(),
        vec![("labelled".to_string(), Some("first".to_string()))]
    );
}

#[test]
fn plugin_disabled_by_its_section() {
    let config = SensorConfig::from_ini_str("[injector]\nenabled = false\n").unwrap();
    let (sensor, _) = start(&config, kestrel::plugins());

    assert!(sensor.bus().plugins().all(|(_, name)| name != "injector"));
}

#[test]
fn allow_list_selects_plugins() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let config = SensorConfig::from_ini_str("[kestrel]\nenabled_plugins = cache-probe\n").unwrap();
    let mut plugins = kestrel::plugins();
    plugins.push(probe(seen));

    let (sensor, _) = start(&config, plugins);

    let names: Vec<&str> = sensor.bus().plugins().map(|(_, name)| name).collect();
    assert_eq!(names, vec!["cache-probe"]);
}

#[test]
fn invalid_plugin_config_fails_startup() {
    let config = SensorConfig::from_ini_str("[injector]\nloader_routine =\n").unwrap();
    let platform: Arc<dyn Platform> = Arc::new(SimulatedPlatform::new());

    let result = Sensor::start(&config, platform, kestrel::plugins());

    #[cfg(feature = "injector")]
    assert!(result.is_err());
    #[cfg(not(feature = "injector"))]
    assert!(result.is_ok());
}
