//! Process lifecycle: `execute` and `halt`, plus the ring transition
//! primitives.
//!
//! `execute` parses a command line, validates the executable, builds the
//! child PCB at the base of its kernel stack, maps and loads the image,
//! and drops to ring 3 with an IRETQ. The call "returns" only when the
//! child (or a descendant standing in for it) halts: `halt` tears the
//! process down and resumes the parent's saved kernel continuation with
//! the exit status in the return register.
//!
//! The continuation format is shared with the scheduler's
//! [`switch_context`](crate::scheduler::switch_context): five
//! callee-saved registers (rbx, r12..r15) pushed above the return
//! address, rsp/rbp captured in a [`KernelContext`]. Either primitive
//! can resume a continuation the other captured; a continuation resumed
//! by the scheduler simply sees a garbage return value, which only
//! happens for the fire-and-forget shell spawns of a terminal switch.

use core::arch::naked_asm;
use core::ptr::addr_of_mut;

use x86_64::VirtAddr;

use crate::drivers::terminal;
use crate::fs;
use crate::gdt;
use crate::paging;
use crate::process::{self, KernelContext, Pcb, RETURN_EXCEPTION};
use crate::scheduler;
use crate::userspace::syscall::SyscallError;
use crate::{println, serial_println, userspace};

/// Loads in 1 KiB slices, like the rest of the image pipeline.
const LOAD_CHUNK: usize = 1024;

/// Kernel continuation of the boot path. Saved when the very first
/// shell launches and never resumed; the boot stack is abandoned.
static mut BOOT_CONTEXT: KernelContext = KernelContext { rsp: 0, rbp: 0 };

/// A parsed command line: leading word as the program name, the
/// remainder (trimmed of surrounding spaces) as arguments.
#[derive(Debug, Clone, Copy)]
pub struct Command {
    filename: [u8; fs::FILENAME_SIZE],
    filename_len: usize,
    args: [u8; process::ARGS_LENGTH],
    args_len: usize,
}

impl Command {
    /// The program name.
    #[must_use]
    pub fn filename(&self) -> &[u8] {
        &self.filename[..self.filename_len]
    }

    /// The argument bytes, without a terminator.
    #[must_use]
    pub fn args(&self) -> &[u8] {
        &self.args[..self.args_len]
    }
}

/// Split a raw command line into program name and arguments.
///
/// The name is everything up to the first space, newline, terminator or
/// the 32-byte cap; leading spaces before and trailing spaces after the
/// arguments are dropped.
///
/// # Errors
/// Fails on an empty program name.
pub fn parse_command(command: &[u8]) -> Result<Command, SyscallError> {
    let mut filename = [0u8; fs::FILENAME_SIZE];
    let mut args = [0u8; process::ARGS_LENGTH];

    let mut index = 0;
    let mut filename_len = 0;
    while index < command.len()
        && filename_len < fs::FILENAME_SIZE
        && !matches!(command[index], b' ' | b'\n' | 0)
    {
        filename[filename_len] = command[index];
        filename_len += 1;
        index += 1;
    }

    if filename_len == 0 {
        return Err(SyscallError::BadArgument);
    }

    while index < command.len() && command[index] == b' ' {
        index += 1;
    }

    let mut args_len = 0;
    while index < command.len()
        && args_len < process::ARGS_LENGTH
        && !matches!(command[index], b'\n' | 0)
    {
        args[args_len] = command[index];
        args_len += 1;
        index += 1;
    }

    while args_len > 0 && args[args_len - 1] == b' ' {
        args[args_len - 1] = 0;
        args_len -= 1;
    }

    Ok(Command {
        filename,
        filename_len,
        args,
        args_len,
    })
}

/// Execute `command` on behalf of the current process (or, during boot
/// and terminal switches, on behalf of the kernel, into the active
/// terminal).
///
/// Returns the child's exit status once it halts.
///
/// # Errors
/// Fails on an unparsable command, an unresolvable or non-executable
/// file, or pid exhaustion. Validation failures leave no trace.
pub fn execute(command: &[u8]) -> Result<i64, SyscallError> {
    let terminal_index = match process::current_pcb() {
        // SAFETY: current_pcb points at the live PCB of the running pid.
        Some(pcb) => unsafe { (*pcb).terminal },
        None => terminal::active_index(),
    };

    execute_in(command, terminal_index)
}

/// [`execute`] with an explicit target terminal. Used where the target
/// is not the current process's terminal: the root-shell respawn path
/// (no process is current any more) and the terminal switch, which
/// spawns a shell into the newly activated terminal while a process of
/// another terminal still counts as executing.
pub fn execute_in(command: &[u8], terminal_index: usize) -> Result<i64, SyscallError> {
    let parsed = parse_command(command)?;

    let fs = fs::system().ok_or(SyscallError::NoFileSystem)?;
    let dentry = fs
        .read_dentry_by_name(parsed.filename())
        .ok_or(SyscallError::NotFound)?;
    if dentry.file_type != fs::FileType::Regular {
        return Err(SyscallError::BadExecutable);
    }

    let mut header = [0u8; userspace::ELF_ENTRY_OFFSET + 4];
    let header_read = fs
        .read_data(dentry.inode, 0, &mut header)
        .map_err(|_| SyscallError::BadExecutable)?;
    if header_read < header.len() || header[..4] != userspace::ELF_MAGIC {
        return Err(SyscallError::BadExecutable);
    }

    let entry_point = u64::from(u32::from_le_bytes(
        header[userspace::ELF_ENTRY_OFFSET..userspace::ELF_ENTRY_OFFSET + 4]
            .try_into()
            .expect("four header bytes"),
    ));

    let image_length = fs
        .file_length(dentry.inode)
        .map_err(|_| SyscallError::BadExecutable)?;
    if image_length as u64 > paging::USER_IMAGE_SIZE - userspace::IMAGE_LOAD_OFFSET {
        return Err(SyscallError::BadExecutable);
    }

    // From here on global state changes; interrupts stay off until the
    // IRETQ re-enables them in the child's saved flags.
    x86_64::instructions::interrupts::disable();

    let Some(pid) = process::allocate_pid() else {
        println!("Max processes reached");
        return Err(SyscallError::NoPids);
    };

    let parent_pid = terminal::with_terminal(terminal_index, |term| term.top_pid());

    let mut pcb = Pcb::new(pid, terminal_index, parent_pid);
    pcb.args[..parsed.args_len].copy_from_slice(parsed.args());
    pcb.args_len = parsed.args_len;

    let user_phys = pcb.user_phys;
    let esp0 = pcb.esp0;
    let user_rsp = pcb.user_rsp;

    // SAFETY:
    // The pid is freshly allocated, so its stack-base slot is unused.
    unsafe {
        process::install_pcb(pcb);
    }
    terminal::with_terminal(terminal_index, |term| term.push_child(pid));

    paging::map_user_region(user_phys);
    paging::flush_tlb();

    if let Err(error) = load_image(fs, dentry.inode) {
        // Roll the half-built process back and give the caller its
        // address space again.
        terminal::with_terminal(terminal_index, |term| term.pop_child());
        let _ = process::free_pid(pid);
        if let Some(parent) = parent_pid {
            // SAFETY: the parent pid is live; it is waiting on this call.
            let parent_phys = unsafe { (*process::pcb_ptr(parent)).user_phys };
            paging::map_user_region(parent_phys);
            paging::flush_tlb();
        }
        return Err(error);
    }

    // Capture where halt (or the scheduler) must resume the caller.
    let save_context: *mut KernelContext = match process::current_pcb() {
        // SAFETY: the current PCB stays alive while its child runs.
        Some(current) => unsafe { addr_of_mut!((*current).kctx) },
        None => addr_of_mut!(BOOT_CONTEXT),
    };

    gdt::set_kernel_stack(VirtAddr::new(esp0));
    scheduler::set_executing_terminal(terminal_index);
    process::set_current_pid(pid);

    let user_cs = u64::from(gdt::user_code_selector().0);
    let user_ds = u64::from(gdt::user_data_selector().0);

    // SAFETY:
    // The image window maps the loaded binary with user access, the
    // selectors are the ring 3 entries of the GDT, RSP0 points at the
    // child's kernel stack, and `save_context` outlives the child.
    let status = unsafe { enter_user(entry_point, user_rsp, user_cs, user_ds, save_context) };

    Ok(status)
}

/// Copy the executable into the image window, 1 KiB at a time.
fn load_image(fs: &fs::FileSystem<'_>, inode: u32) -> Result<(), SyscallError> {
    let window = (paging::USER_IMAGE_SIZE - userspace::IMAGE_LOAD_OFFSET) as usize;
    let mut offset = 0usize;

    loop {
        let load_address = (userspace::USER_IMAGE_START
            + userspace::IMAGE_LOAD_OFFSET
            + offset as u64) as *mut u8;

        let chunk_len = core::cmp::min(LOAD_CHUNK, window - offset);
        if chunk_len == 0 {
            return Ok(());
        }

        // SAFETY:
        // The window is mapped writable and the slice is clamped to it.
        let chunk = unsafe { core::slice::from_raw_parts_mut(load_address, chunk_len) };

        let copied = fs
            .read_data(inode, offset, chunk)
            .map_err(|_| SyscallError::BadExecutable)?;
        if copied == 0 {
            return Ok(());
        }
        offset += copied;
    }
}

/// Terminate the current process and never return.
///
/// Closes the file table, releases the pid and any `vidmap` page,
/// detaches from the owning terminal, and either resumes the parent's
/// `execute` with `status` (exception deaths report
/// [`RETURN_EXCEPTION`] instead) or, for a root shell, restarts a fresh
/// shell in the same terminal.
pub fn halt(status: i64) -> ! {
    x86_64::instructions::interrupts::disable();

    let pcb_ptr = process::current_pcb().expect("halt without a current process");
    // SAFETY: the current PCB is live until this function tears it down.
    let pcb = unsafe { &mut *pcb_ptr };

    let retval = if pcb.retval == RETURN_EXCEPTION {
        RETURN_EXCEPTION
    } else {
        status
    };

    pcb.fds.close_all();

    if process::free_pid(pcb.pid).is_err() {
        serial_println!("halt: pid {} was not allocated", pcb.pid);
    }

    if pcb.vidmap_addr != 0 {
        paging::unmap_user_video();
        pcb.vidmap_addr = 0;
    }

    let terminal_index = pcb.terminal;
    terminal::with_terminal(terminal_index, |term| term.pop_child());

    match pcb.parent {
        Some(parent_pid) => {
            // SAFETY: the parent pid is live; it is blocked in execute.
            let parent = unsafe { &*process::pcb_ptr(parent_pid) };

            paging::map_user_region(parent.user_phys);
            paging::flush_tlb();
            gdt::set_kernel_stack(VirtAddr::new(parent.esp0));
            process::set_current_pid(parent_pid);

            // SAFETY:
            // The parent's continuation was captured by enter_user when
            // it launched this child and has not been resumed since.
            unsafe { resume_kernel(&parent.kctx, retval) }
        }
        None => {
            // A root shell died; the terminal must never be left without
            // one. Respawn on the freed kernel stack.
            process::set_current_pid(0);
            terminal::with_terminal(terminal_index, |term| term.clear());

            // SAFETY:
            // The freed pid's stack is no longer owned by any process;
            // the respawned shell will reuse it.
            unsafe {
                exec_shell_on(
                    process::kernel_stack_top(pcb.pid).as_u64(),
                    terminal_index as u64,
                )
            }
        }
    }
}

/// Drop to ring 3 at `entry_point`, saving the calling kernel
/// continuation into `save` first.
///
/// Returns when [`halt`] resumes the saved continuation; the return
/// value is the halting process's status. See the module docs for the
/// continuation format shared with the scheduler.
///
/// # Safety
/// `entry_point`/`user_rsp` must lie in mapped user-accessible memory,
/// the selectors must be the GDT's ring 3 entries, RSP0 must point at
/// the current process's kernel stack, and `save` must stay valid until
/// the continuation is resumed.
#[unsafe(naked)]
unsafe extern "C" fn enter_user(
    entry_point: u64,
    user_rsp: u64,
    user_cs: u64,
    user_ds: u64,
    save: *mut KernelContext,
) -> i64 {
    // Arguments per the System V ABI: rdi, rsi, rdx, rcx, r8.
    naked_asm!(
        // Callee-saved frame, shared layout with switch_context.
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [r8], rsp",
        "mov [r8 + 8], rbp",
        // User data segment into the data selectors.
        "mov rax, rcx",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        // IRETQ frame: SS, RSP, RFLAGS (IF set), CS, RIP.
        "push rcx",
        "push rsi",
        "pushfq",
        "pop r11",
        "or r11, 0x200",
        "push r11",
        "push rdx",
        "push rdi",
        "iretq",
    );
}

/// Resume a kernel continuation captured by [`enter_user`], making it
/// return `retval`.
///
/// # Safety
/// `context` must hold a continuation captured by `enter_user` on a
/// kernel stack that has not been resumed or reused since.
#[unsafe(naked)]
unsafe extern "C" fn resume_kernel(context: *const KernelContext, retval: i64) -> ! {
    naked_asm!(
        "mov rsp, [rdi]",
        "mov rbp, [rdi + 8]",
        "mov rax, rsi",
        // Back to kernel-neutral data selectors.
        "xor rcx, rcx",
        "mov ds, cx",
        "mov es, cx",
        "mov fs, cx",
        "mov gs, cx",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "ret",
    );
}

/// Restart a shell for `terminal_index` on the freed stack at
/// `stack_top`. Never returns to the caller.
///
/// # Safety
/// `stack_top` must be the top of a kernel stack no live process owns.
#[unsafe(naked)]
unsafe extern "C" fn exec_shell_on(stack_top: u64, terminal_index: u64) -> ! {
    naked_asm!(
        "mov rsp, rdi",
        "xor rbp, rbp",
        "mov rdi, rsi",
        "call {respawn}",
        // respawn_shell diverges; give the fall-through a hard stop.
        "ud2",
        respawn = sym respawn_shell,
    );
}

/// The landing point of [`exec_shell_on`]: execute a fresh shell, or
/// park the terminal if the binary is gone.
extern "C" fn respawn_shell(terminal_index: u64) -> ! {
    match execute_in(b"shell", terminal_index as usize) {
        // The respawned shell's execute only comes back when the
        // scheduler resumes this context; there is no caller to hand
        // the status to, so spin it down.
        Ok(_) => crate::hlt_loop(),
        Err(error) => {
            serial_println!(
                "terminal {}: cannot respawn shell ({:?})",
                terminal_index,
                error
            );
            x86_64::instructions::interrupts::enable();
            crate::hlt_loop()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_parse_plain_command() {
        let parsed = parse_command(b"shell").expect("parses");
        assert_eq!(parsed.filename(), b"shell", "bare name is the filename");
        assert_eq!(parsed.args(), b"", "no arguments present");
    }

    #[test_case]
    fn test_parse_command_with_args_and_padding() {
        let parsed = parse_command(b"cat   frame0.txt  ").expect("parses");
        assert_eq!(parsed.filename(), b"cat", "name stops at the first space");
        assert_eq!(
            parsed.args(),
            b"frame0.txt",
            "leading and trailing spaces are trimmed",
        );
    }

    #[test_case]
    fn test_parse_command_stops_at_newline() {
        let parsed = parse_command(b"ls\n").expect("parses");
        assert_eq!(parsed.filename(), b"ls", "newline terminates the name");
        assert_eq!(parsed.args(), b"", "nothing after the newline counts");
    }

    #[test_case]
    fn test_parse_empty_command_fails() {
        assert!(parse_command(b"").is_err(), "empty input has no filename");
        assert!(
            parse_command(b"   ").is_err(),
            "leading space means an empty filename",
        );
        assert!(parse_command(b"\n").is_err(), "newline alone has no filename");
    }

    #[test_case]
    fn test_parse_command_caps_filename_length() {
        let long = [b'a'; 64];
        let parsed = parse_command(&long).expect("parses");
        assert_eq!(
            parsed.filename().len(),
            fs::FILENAME_SIZE,
            "the name is capped at 32 bytes",
        );
    }
}
