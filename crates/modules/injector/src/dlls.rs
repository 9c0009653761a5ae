use bitflags::bitflags;
use kestrel_core::{deferred::Personality, platform::OsVersion};
use widestring::U16Str;

bitflags! {
    /// System images the loader maps before a process can load our library.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SystemDll: u32 {
        const SYSTEM32_NTDLL = 1 << 0;
        const SYSTEM32_KERNEL32 = 1 << 1;
        const SYSTEM32_KERNELBASE = 1 << 2;
        const SYSTEM32_WOW64 = 1 << 3;
        const SYSTEM32_WOW64WIN = 1 << 4;
        const SYSTEM32_WOW64CPU = 1 << 5;
        const SYSWOW64_NTDLL = 1 << 6;
        const SYSWOW64_KERNEL32 = 1 << 7;
        const SYSWOW64_KERNELBASE = 1 << 8;
    }
}

const SUFFIXES: [(&str, SystemDll); 9] = [
    (r"\system32\ntdll.dll", SystemDll::SYSTEM32_NTDLL),
    (r"\system32\kernel32.dll", SystemDll::SYSTEM32_KERNEL32),
    (r"\system32\kernelbase.dll", SystemDll::SYSTEM32_KERNELBASE),
    (r"\system32\wow64.dll", SystemDll::SYSTEM32_WOW64),
    (r"\system32\wow64win.dll", SystemDll::SYSTEM32_WOW64WIN),
    (r"\system32\wow64cpu.dll", SystemDll::SYSTEM32_WOW64CPU),
    (r"\syswow64\ntdll.dll", SystemDll::SYSWOW64_NTDLL),
    (r"\syswow64\kernel32.dll", SystemDll::SYSWOW64_KERNEL32),
    (r"\syswow64\kernelbase.dll", SystemDll::SYSWOW64_KERNELBASE),
];

impl SystemDll {
    /// Identifies an image by the tail of its path, ignoring ASCII case.
    /// Unknown images map to the empty set.
    pub fn from_path(path: &U16Str) -> SystemDll {
        SUFFIXES
            .iter()
            .find(|(suffix, _)| ends_with_ignore_case(path.as_slice(), suffix))
            .map_or(SystemDll::empty(), |(_, dll)| *dll)
    }

    /// Images which must all be mapped before injecting a process.
    pub fn required(personality: Personality, os: OsVersion) -> SystemDll {
        let (base, legacy) = match personality {
            Personality::Native => (
                SystemDll::SYSTEM32_NTDLL,
                SystemDll::SYSTEM32_KERNEL32 | SystemDll::SYSTEM32_KERNELBASE,
            ),
            Personality::Wow64 => (
                SystemDll::SYSTEM32_WOW64
                    | SystemDll::SYSTEM32_WOW64WIN
                    | SystemDll::SYSTEM32_WOW64CPU
                    | SystemDll::SYSWOW64_NTDLL,
                SystemDll::SYSWOW64_KERNEL32 | SystemDll::SYSWOW64_KERNELBASE,
            ),
        };
        if os.is_windows7() {
            base | legacy
        } else {
            base
        }
    }

    /// The ntdll exporting the loader routine for `personality`.
    pub fn matching(personality: Personality) -> SystemDll {
        match personality {
            Personality::Native => SystemDll::SYSTEM32_NTDLL,
            Personality::Wow64 => SystemDll::SYSWOW64_NTDLL,
        }
    }
}

fn ends_with_ignore_case(path: &[u16], suffix: &str) -> bool {
    let suffix_len = suffix.len();
    if path.len() < suffix_len {
        return false;
    }
    path[path.len() - suffix_len..]
        .iter()
        .zip(suffix.bytes())
        .all(|(unit, expected)| {
            u8::try_from(*unit).is_ok_and(|unit| unit.to_ascii_lowercase() == expected)
        })
}
