//! The system-call surface. Arguments and results are plain Rust values
//! here rather than register reads: this crate has no CPU emulation layer,
//! so a caller (the runtime, or a test) constructs a [`Syscall`] directly
//! instead of having it decoded out of machine registers.

pub type Fd = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Syscall {
    Exit { code: i32 },
    GetPid,
    Yield,
    Spawn { path: String, argv: Vec<String> },
    Wait { pid: u64 },

    GetObj { parent: Fd, path: String, rights: u32 },

    HandleRead { handle: Fd, len: usize },
    HandleWrite { handle: Fd, data: Vec<u8> },
    HandleSeek { handle: Fd, offset: i64, whence: Whence },
    HandleClose { handle: Fd },
    HandleDuplicate { handle: Fd, rights: u32 },

    ChannelCreate { rights: u32 },
    ChannelSend { handle: Fd, data: Vec<u8>, handles: Vec<Fd> },
    ChannelRecv { handle: Fd, max_len: usize },

    VmoCreate { size: u64, flags: u32, rights: u32 },
    VmoMap { handle: Fd, vaddr_hint: Option<u64>, offset: u64, len: u64, rights: u32 },
    VmoUnmap { vaddr: u64, len: u64 },
    VmoResize { handle: Fd, size: u64 },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallReturn {
    Status(i64),
    Handle(Fd),
    Handles(Fd, Fd),
    Pid(u64),
    Count(usize),
    Data(Vec<u8>),
    Addr(u64),
    Offset(u64),
    Message { data: Vec<u8>, handles: Vec<Fd> },
}

impl SyscallReturn {
    /// Collapse any successful return into the single `i64` a syscall ABI
    /// would actually hand back in a general-purpose register; byte
    /// payloads (`recv`) are returned out-of-band via a caller-supplied
    /// buffer in a real ABI and are not represented by this code.
    pub fn as_status(&self) -> i64 {
        match self {
            SyscallReturn::Status(v) => *v,
            SyscallReturn::Handle(h) => *h,
            SyscallReturn::Handles(a, _) => *a,
            SyscallReturn::Pid(p) => *p as i64,
            SyscallReturn::Count(c) => *c as i64,
            SyscallReturn::Data(d) => d.len() as i64,
            SyscallReturn::Addr(a) => *a as i64,
            SyscallReturn::Offset(o) => *o as i64,
            SyscallReturn::Message { data, .. } => data.len() as i64,
        }
    }
}
