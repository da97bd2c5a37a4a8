//! The `int 0x80` system-call surface.
//!
//! User programs put the call number in `rax` and up to three arguments
//! in `rdi`, `rsi`, `rdx`; the result comes back in `rax`, with -1 for
//! every refused call. The gate is a DPL 3 trap gate, so interrupts stay
//! enabled while a syscall runs and the scheduler can preempt it.
//!
//! Handlers work on the current PCB, recovered from the kernel stack
//! pointer, and return [`SysResult`]; the dispatcher flattens every
//! error into -1 at the boundary.

use core::arch::naked_asm;

use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::{PrivilegeLevel, VirtAddr};

use crate::drivers::{rtc, terminal};
use crate::fs;
use crate::paging;
use crate::process::{self, Pcb};
use crate::userspace::{
    self,
    file::{FileOps, OpenFile},
    process as uproc,
};

/// Terminate the current process.
pub const SYS_HALT: u64 = 1;
/// Run a program and wait for its status.
pub const SYS_EXECUTE: u64 = 2;
/// Read from a descriptor.
pub const SYS_READ: u64 = 3;
/// Write to a descriptor.
pub const SYS_WRITE: u64 = 4;
/// Bind a named file to a descriptor.
pub const SYS_OPEN: u64 = 5;
/// Release a descriptor.
pub const SYS_CLOSE: u64 = 6;
/// Copy the command-line arguments out.
pub const SYS_GETARGS: u64 = 7;
/// Map the video page into user space.
pub const SYS_VIDMAP: u64 = 8;
/// Reserved signal surface; accepted, no effect.
pub const SYS_SET_HANDLER: u64 = 9;
/// Reserved signal surface; accepted, no effect.
pub const SYS_SIGRETURN: u64 = 10;

/// Longest command line `execute` will fetch from user space: a name,
/// a space and a full argument buffer.
const MAX_COMMAND_BYTES: usize = fs::FILENAME_SIZE + 1 + process::ARGS_LENGTH;

/// Why a syscall was refused. Every variant surfaces to user space
/// as -1; the distinction exists for kernel-internal callers and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    /// A pointer argument lies outside the user image window.
    BadPointer,
    /// A descriptor index is out of range or unbound.
    BadFd,
    /// A malformed argument (empty name, bad length, bad frequency).
    BadArgument,
    /// The named file does not exist.
    NotFound,
    /// The file is not a loadable executable.
    BadExecutable,
    /// All pids are live.
    NoPids,
    /// The descriptor table is full.
    TableFull,
    /// The descriptor does not support the requested operation.
    Unsupported,
    /// No file system image was mounted at boot.
    NoFileSystem,
}

/// Result type of every syscall handler.
pub type SysResult = Result<i64, SyscallError>;

/// Register the syscall gate: vector 0x80, DPL 3, trap semantics so the
/// interrupt flag is preserved on entry.
pub fn register(idt: &mut InterruptDescriptorTable) {
    let entry = &mut idt[usize::from(userspace::SYSCALL_INTERRUPT_INDEX)];

    // SAFETY:
    // The naked entry below preserves the full register state and
    // returns with iretq.
    unsafe {
        let handler = VirtAddr::new(syscall_entry as *const () as u64);
        entry
            .set_handler_addr(handler)
            .set_privilege_level(PrivilegeLevel::Ring3)
            .disable_interrupts(false);
    }
}

/// Naked entry point for the `int 0x80` syscall interrupt.
///
/// Saves all general-purpose registers, forwards (number, arg1..arg3)
/// to [`syscall_dispatch`], stores the result into the saved `rax` slot
/// and returns to user mode. `halt` and a successful `execute` leave
/// through their own continuations instead of falling out of the
/// dispatcher; the register frame this entry builds is simply abandoned
/// in that case.
///
/// # Register layout on the stack after all pushes
///
/// ```text
/// rsp + 0x00 : r15
/// rsp + 0x08 : r14
/// rsp + 0x10 : r13
/// rsp + 0x18 : r12
/// rsp + 0x20 : r11
/// rsp + 0x28 : r10
/// rsp + 0x30 : r9
/// rsp + 0x38 : r8
/// rsp + 0x40 : rbp
/// rsp + 0x48 : rdi  (arg1)
/// rsp + 0x50 : rsi  (arg2)
/// rsp + 0x58 : rdx  (arg3)
/// rsp + 0x60 : rcx
/// rsp + 0x68 : rbx
/// rsp + 0x70 : rax  (syscall number)
/// rsp + 0x78 : RIP  (pushed by CPU)
/// rsp + 0x80 : CS
/// rsp + 0x88 : RFLAGS
/// rsp + 0x90 : RSP
/// rsp + 0x98 : SS
/// ```
#[unsafe(naked)]
pub extern "C" fn syscall_entry() {
    naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // System V argument registers for the Rust dispatcher:
        //   rdi = syscall number (was in rax)
        //   rsi = arg1 (was in rdi)
        //   rdx = arg2 (was in rsi)
        //   rcx = arg3 (was in rdx)
        "mov rdi, [rsp + 0x70]",
        "mov rsi, [rsp + 0x48]",
        "mov rdx, [rsp + 0x50]",
        "mov rcx, [rsp + 0x58]",
        "call {dispatch}",
        "mov [rsp + 0x70], rax",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
        dispatch = sym syscall_dispatch,
    );
}

/// Validate the call number and route to the handler; flatten errors
/// to -1.
extern "C" fn syscall_dispatch(number: u64, arg1: u64, arg2: u64, arg3: u64) -> i64 {
    let result = match number {
        SYS_HALT => uproc::halt((arg1 & 0xFF) as i64),
        SYS_EXECUTE => sys_execute(arg1),
        SYS_READ => sys_read(arg1, arg2, arg3),
        SYS_WRITE => sys_write(arg1, arg2, arg3),
        SYS_OPEN => sys_open(arg1),
        SYS_CLOSE => sys_close(arg1),
        SYS_GETARGS => sys_getargs(arg1, arg2),
        SYS_VIDMAP => sys_vidmap(arg1),
        // Reserved signal surface: accepted for parity, no effect.
        SYS_SET_HANDLER | SYS_SIGRETURN => Ok(0),
        _ => Err(SyscallError::BadArgument),
    };

    result.unwrap_or(-1)
}

/// The PCB of the process that trapped in.
fn current() -> Result<&'static mut Pcb, SyscallError> {
    let pcb = process::current_pcb().ok_or(SyscallError::BadArgument)?;

    // SAFETY:
    // Syscalls only arrive from ring 3, so a live process is current and
    // its PCB sits at the base of the stack this handler runs on. The
    // reference dies with the handler invocation.
    Ok(unsafe { &mut *pcb })
}

/// Borrow `[ptr, ptr + len)` from the current user image window.
fn user_slice(ptr: u64, len: u64) -> Result<&'static [u8], SyscallError> {
    if !userspace::user_range_valid(ptr, len) {
        return Err(SyscallError::BadPointer);
    }

    // SAFETY:
    // The range lies inside the 4 MiB window, which is fully mapped for
    // the current process.
    Ok(unsafe { core::slice::from_raw_parts(ptr as *const u8, len as usize) })
}

/// Mutable variant of [`user_slice`].
fn user_slice_mut(ptr: u64, len: u64) -> Result<&'static mut [u8], SyscallError> {
    if !userspace::user_range_valid(ptr, len) {
        return Err(SyscallError::BadPointer);
    }

    // SAFETY:
    // As in `user_slice`; the window is mapped writable.
    Ok(unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len as usize) })
}

/// Fetch a null-terminated user string of at most `max` bytes,
/// clamped to the window end.
fn user_cstr(ptr: u64, max: usize) -> Result<&'static [u8], SyscallError> {
    if !userspace::user_range_valid(ptr, 1) {
        return Err(SyscallError::BadPointer);
    }

    let available = core::cmp::min(max as u64, userspace::USER_IMAGE_END - ptr);
    let raw = user_slice(ptr, available)?;

    let end = raw.iter().position(|&byte| byte == 0).unwrap_or(raw.len());
    Ok(&raw[..end])
}

fn sys_execute(command_ptr: u64) -> SysResult {
    let command = user_cstr(command_ptr, MAX_COMMAND_BYTES)?;
    uproc::execute(command)
}

fn sys_read(fd: u64, buf: u64, nbytes: u64) -> SysResult {
    let pcb = current()?;
    let fd = fd as usize;

    let entry = *pcb.fds.get(fd).ok_or(SyscallError::BadFd)?;

    match entry.ops {
        FileOps::Stdin => {
            let buf = user_slice_mut(buf, nbytes)?;
            Ok(terminal::read(buf))
        }
        FileOps::Stdout => Err(SyscallError::Unsupported),
        FileOps::Rtc => {
            // Virtualised frequency: wait out this descriptor's share of
            // hardware ticks. The buffer is ignored.
            rtc::wait_ticks(entry.pos);
            Ok(0)
        }
        FileOps::Directory => {
            let buf = user_slice_mut(buf, nbytes)?;
            let fs = fs::system().ok_or(SyscallError::NoFileSystem)?;

            let Some(dentry) = fs.read_dentry_by_index(entry.pos) else {
                // Enumeration finished.
                return Ok(0);
            };

            let name = dentry.name();
            let count = core::cmp::min(buf.len(), name.len());
            buf[..count].copy_from_slice(&name[..count]);

            let slot = pcb.fds.get_mut(fd).ok_or(SyscallError::BadFd)?;
            slot.pos += 1;

            Ok(count as i64)
        }
        FileOps::Regular => {
            let buf = user_slice_mut(buf, nbytes)?;
            let fs = fs::system().ok_or(SyscallError::NoFileSystem)?;

            let copied = fs
                .read_data(entry.inode, entry.pos as usize, buf)
                .map_err(|_| SyscallError::BadFd)?;

            let slot = pcb.fds.get_mut(fd).ok_or(SyscallError::BadFd)?;
            slot.pos += copied as u32;

            Ok(copied as i64)
        }
    }
}

fn sys_write(fd: u64, buf: u64, nbytes: u64) -> SysResult {
    let pcb = current()?;
    let fd = fd as usize;

    let entry = *pcb.fds.get(fd).ok_or(SyscallError::BadFd)?;

    match entry.ops {
        FileOps::Stdout => {
            let buf = user_slice(buf, nbytes)?;
            Ok(terminal::write(buf))
        }
        FileOps::Rtc => {
            if nbytes != 4 {
                return Err(SyscallError::BadArgument);
            }
            let raw = user_slice(buf, 4)?;
            let frequency = u32::from_le_bytes(raw.try_into().expect("four bytes"));

            let ticks = rtc::ticks_per_read(frequency).ok_or(SyscallError::BadArgument)?;
            let slot = pcb.fds.get_mut(fd).ok_or(SyscallError::BadFd)?;
            slot.pos = ticks;

            Ok(4)
        }
        // The file system is read-only; stdin is not a sink.
        FileOps::Stdin | FileOps::Directory | FileOps::Regular => Err(SyscallError::Unsupported),
    }
}

fn sys_open(filename_ptr: u64) -> SysResult {
    let pcb = current()?;
    let name = user_cstr(filename_ptr, fs::FILENAME_SIZE)?;
    if name.is_empty() {
        return Err(SyscallError::BadArgument);
    }

    let fs = fs::system().ok_or(SyscallError::NoFileSystem)?;
    let dentry = fs.read_dentry_by_name(name).ok_or(SyscallError::NotFound)?;

    let file = match dentry.file_type {
        fs::FileType::Rtc => OpenFile::new(FileOps::Rtc),
        fs::FileType::Directory => OpenFile::new(FileOps::Directory),
        fs::FileType::Regular => OpenFile {
            ops: FileOps::Regular,
            inode: dentry.inode,
            pos: 0,
        },
    };

    let fd = pcb.fds.open(file).ok_or(SyscallError::TableFull)?;
    Ok(fd as i64)
}

fn sys_close(fd: u64) -> SysResult {
    let pcb = current()?;
    pcb.fds
        .close(fd as usize)
        .map(|()| 0)
        .map_err(|()| SyscallError::BadFd)
}

fn sys_getargs(buf: u64, nbytes: u64) -> SysResult {
    let pcb = current()?;

    // The caller must have room for the arguments and the terminator.
    if (nbytes as usize) < pcb.args_len + 1 {
        return Err(SyscallError::BadArgument);
    }

    let out = user_slice_mut(buf, nbytes)?;
    out[..pcb.args_len].copy_from_slice(&pcb.args[..pcb.args_len]);
    out[pcb.args_len] = 0;

    Ok(0)
}

fn sys_vidmap(screen_start_ptr: u64) -> SysResult {
    let pcb = current()?;

    // The out-pointer itself must live in user memory.
    let out = user_slice_mut(screen_start_ptr, 8)?;

    // The page tracks what the owning terminal shows: real VRAM when it
    // is on screen, its backup page while it is hidden.
    let frame = if pcb.terminal == terminal::active_index() {
        paging::vram_frame()
    } else {
        terminal::with_terminal(pcb.terminal, |term| term.backup_frame())
    };

    paging::map_user_video(frame);
    pcb.vidmap_addr = paging::USER_VIDEO_VIRT;

    out.copy_from_slice(&paging::USER_VIDEO_VIRT.to_le_bytes());

    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_unknown_syscall_number_rejected() {
        assert_eq!(
            syscall_dispatch(0, 0, 0, 0),
            -1,
            "call number 0 is outside the surface",
        );
        assert_eq!(
            syscall_dispatch(11, 0, 0, 0),
            -1,
            "call number 11 is outside the surface",
        );
    }

    #[test_case]
    fn test_signal_stubs_accept() {
        assert_eq!(
            syscall_dispatch(SYS_SET_HANDLER, 2, 0, 0),
            0,
            "set_handler is surface parity and reports success",
        );
        assert_eq!(
            syscall_dispatch(SYS_SIGRETURN, 0, 0, 0),
            0,
            "sigreturn is surface parity and reports success",
        );
    }

    #[test_case]
    fn test_read_rejects_without_process() {
        // No process is current under the test harness, so fd-relative
        // calls must refuse instead of masking a bogus PCB.
        assert_eq!(syscall_dispatch(SYS_READ, 0, 0, 0), -1, "read refuses");
        assert_eq!(syscall_dispatch(SYS_CLOSE, 2, 0, 0), -1, "close refuses");
        assert_eq!(syscall_dispatch(SYS_VIDMAP, 0, 0, 0), -1, "vidmap refuses");
    }

    #[test_case]
    fn test_execute_rejects_kernel_pointer() {
        let kernel_buf = b"shell\0";
        assert_eq!(
            syscall_dispatch(SYS_EXECUTE, kernel_buf.as_ptr() as u64, 0, 0),
            -1,
            "command pointers outside the user window are refused",
        );
    }
}
