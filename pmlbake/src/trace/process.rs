//! Processes and their loaded modules, as recorded in the process table.

use crate::symbolization::address_range::{self, AddressRange};
use pmlbake_common::SYSTEM_PROCESS_NAME;

/// A module mapped into a process at capture time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub base: u64,
    pub size: u32,
    pub image_path: String,
}

impl Module {
    /// File name part of the image path (`ntdll.dll` for
    /// `C:\Windows\System32\ntdll.dll`).
    #[must_use]
    pub fn name(&self) -> &str {
        file_name(&self.image_path)
    }
}

impl AddressRange for Module {
    fn base(&self) -> u64 {
        self.base
    }

    fn size(&self) -> u32 {
        self.size
    }
}

/// A process and its modules, sorted ascending by base.
#[derive(Debug, Clone)]
pub struct Process {
    /// Position of the process in the process table; events refer to it.
    pub index: u32,
    pub id: u32,
    pub parent_id: u32,
    pub name: String,
    pub image_path: String,
    pub command_line: String,
    pub modules: Vec<Module>,
}

impl Process {
    /// Module containing `address`, if any.
    #[must_use]
    pub fn find_module(&self, address: u64) -> Option<&Module> {
        address_range::try_find(&self.modules, address)
    }

    /// Directory part of the process image path, if it has one.
    #[must_use]
    pub fn image_directory(&self) -> Option<&str> {
        let cut = self.image_path.rfind(['\\', '/'])?;
        Some(&self.image_path[..cut])
    }

    #[must_use]
    pub fn is_system(&self) -> bool {
        self.name == SYSTEM_PROCESS_NAME
    }
}

/// Append the kernel modules (owned by the `System` process) to every other
/// process so kernel addresses resolve per process, then re-sort each list.
pub fn share_kernel_modules(processes: &mut [Process]) {
    let kernel_modules: Vec<Module> = processes
        .iter()
        .find(|process| process.is_system())
        .map(|system| system.modules.clone())
        .unwrap_or_default();

    for process in processes.iter_mut() {
        if !process.is_system() {
            process.modules.extend(kernel_modules.iter().cloned());
        }
        address_range::sort_by_base(&mut process.modules);
    }
}

/// Last component of a Windows or POSIX path.
#[must_use]
pub fn file_name(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}
