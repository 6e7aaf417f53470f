//! Target-OS syscall tables.
//!
//! Used by the compiler front-end to lower `syscall name(...)` and
//! `int80 name(...)` IL lines into register moves plus a syscall-class
//! gadget.

use crate::arch::ArchKind;
use serde::{Deserialize, Serialize};

/// Target operating system for syscall lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum System {
    Linux,
    Windows,
    None,
}

/// Specification of one syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallDef {
    pub name: &'static str,
    pub num: i64,
    pub nb_args: usize,
}

const LINUX_X86: &[SyscallDef] = &[
    SyscallDef { name: "exit", num: 1, nb_args: 1 },
    SyscallDef { name: "fork", num: 2, nb_args: 0 },
    SyscallDef { name: "read", num: 3, nb_args: 3 },
    SyscallDef { name: "write", num: 4, nb_args: 3 },
    SyscallDef { name: "open", num: 5, nb_args: 3 },
    SyscallDef { name: "close", num: 6, nb_args: 1 },
    SyscallDef { name: "execve", num: 11, nb_args: 3 },
    SyscallDef { name: "mmap", num: 90, nb_args: 6 },
    SyscallDef { name: "munmap", num: 91, nb_args: 2 },
    SyscallDef { name: "mprotect", num: 125, nb_args: 3 },
];

const LINUX_X64: &[SyscallDef] = &[
    SyscallDef { name: "read", num: 0, nb_args: 3 },
    SyscallDef { name: "write", num: 1, nb_args: 3 },
    SyscallDef { name: "open", num: 2, nb_args: 3 },
    SyscallDef { name: "close", num: 3, nb_args: 1 },
    SyscallDef { name: "mmap", num: 9, nb_args: 6 },
    SyscallDef { name: "mprotect", num: 10, nb_args: 3 },
    SyscallDef { name: "fork", num: 57, nb_args: 0 },
    SyscallDef { name: "execve", num: 59, nb_args: 3 },
    SyscallDef { name: "exit", num: 60, nb_args: 1 },
    SyscallDef { name: "munmap", num: 11, nb_args: 2 },
];

/// Look up a syscall by name for one architecture and OS.
pub fn get_syscall_def(arch: ArchKind, sys: System, name: &str) -> Option<&'static SyscallDef> {
    let table = match (sys, arch) {
        (System::Linux, ArchKind::X86) => LINUX_X86,
        (System::Linux, ArchKind::X64) => LINUX_X64,
        _ => return None,
    };
    table.iter().find(|d| d.name == name)
}
