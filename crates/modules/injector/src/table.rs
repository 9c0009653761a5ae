use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use kestrel_core::{deferred::Personality, event::Pid, platform::Address};
use widestring::U16String;

use crate::dlls::SystemDll;

/// Injection progress of a tracked process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionRecord {
    pub pid: Pid,
    pub personality: Personality,
    pub required: SystemDll,
    pub loaded: SystemDll,
    pub matching_dll: SystemDll,
    /// Loader routine exported by `matching_dll`, once it is mapped.
    pub loader_routine: Option<Address>,
    pub dll_path: U16String,
}

impl InjectionRecord {
    pub fn new(pid: Pid, personality: Personality, required: SystemDll, dll_path: U16String) -> Self {
        Self {
            pid,
            personality,
            required,
            loaded: SystemDll::empty(),
            matching_dll: SystemDll::matching(personality),
            loader_routine: None,
            dll_path,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.loaded == self.required
    }
}

/// Processes waiting for their system images, keyed by pid.
///
/// Every mutation takes the write lock. No other lock is ever acquired while
/// holding it.
#[derive(Debug, Default)]
pub struct InjectionTable {
    records: RwLock<HashMap<Pid, InjectionRecord>>,
}

impl InjectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `record.pid`, replacing the record of a previous
    /// process with the same pid.
    pub fn insert(&self, record: InjectionRecord) -> Option<InjectionRecord> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.pid, record)
    }

    pub fn remove(&self, pid: Pid) -> Option<InjectionRecord> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid)
    }

    /// Records that `dll` was mapped at `image_base` in `pid`.
    ///
    /// `resolve` is invoked with the image base when `dll` is the matching
    /// ntdll of the process. Once every required image is mapped the record
    /// leaves the table and is returned: a process is handed out at most once.
    pub fn image_loaded<F>(
        &self,
        pid: Pid,
        dll: SystemDll,
        image_base: Address,
        resolve: F,
    ) -> Option<InjectionRecord>
    where
        F: FnOnce(Address) -> Option<Address>,
    {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let record = records.get_mut(&pid)?;

        record.loaded |= dll & record.required;
        if dll == record.matching_dll {
            record.loader_routine = resolve(image_base);
        }

        if record.is_ready() {
            records.remove(&pid)
        } else {
            None
        }
    }

    pub fn get(&self, pid: Pid) -> Option<InjectionRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pid)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use kestrel_core::platform::OsVersion;

    use super::*;

    const PID: Pid = Pid::from_raw(1200);
    const NTDLL_BASE: Address = 0x7ff8_1000_0000;

    fn track(table: &InjectionTable, personality: Personality) {
        let required = SystemDll::required(personality, OsVersion::WINDOWS_10);
        table.insert(InjectionRecord::new(
            PID,
            personality,
            required,
            U16String::from_str(r"C:\hk.dll"),
        ));
    }

    #[test]
    fn ready_exactly_when_all_required_are_loaded() {
        let table = InjectionTable::new();
        track(&table, Personality::Wow64);
        let wow64 = [
            SystemDll::SYSTEM32_WOW64,
            SystemDll::SYSTEM32_WOW64WIN,
            SystemDll::SYSWOW64_NTDLL,
        ];

        for dll in wow64 {
            assert!(table.image_loaded(PID, dll, 0x1000, |_| Some(0x2000)).is_none());
        }
        assert!(table.get(PID).is_some());

        let ready = table
            .image_loaded(PID, SystemDll::SYSTEM32_WOW64CPU, 0x3000, |_| None)
            .unwrap();
        assert!(ready.is_ready());
        assert_eq!(ready.loader_routine, Some(0x2000));
        assert!(table.get(PID).is_none());

        // Never handed out twice.
        assert!(table.image_loaded(PID, SystemDll::SYSWOW64_NTDLL, 0x1000, |_| Some(1)).is_none());
    }

    #[test]
    fn unrelated_images_are_masked() {
        let table = InjectionTable::new();
        track(&table, Personality::Wow64);

        // The native ntdll is mapped in every process but not required here.
        let result = table.image_loaded(PID, SystemDll::SYSTEM32_NTDLL, NTDLL_BASE, |_| {
            panic!("native ntdll is not the matching image of a wow64 process")
        });

        assert!(result.is_none());
        assert_eq!(table.get(PID).unwrap().loaded, SystemDll::empty());
    }

    #[test]
    fn resolves_only_the_matching_image() {
        let table = InjectionTable::new();
        track(&table, Personality::Native);

        let ready = table
            .image_loaded(PID, SystemDll::SYSTEM32_NTDLL, NTDLL_BASE, |base| Some(base + 0x40))
            .unwrap();

        assert_eq!(ready.loader_routine, Some(NTDLL_BASE + 0x40));
    }

    #[test]
    fn untracked_pid() {
        let table = InjectionTable::new();
        assert!(
            table
                .image_loaded(PID, SystemDll::SYSTEM32_NTDLL, NTDLL_BASE, |_| Some(1))
                .is_none()
        );
        assert!(table.is_empty());
    }
}
