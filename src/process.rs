//! The process model: PCBs, pid allocation and kernel stacks.
//!
//! Every process owns one 8 KiB, 8 KiB-aligned kernel stack, and its PCB
//! lives at the base of that stack. Any code running on behalf of the
//! process can therefore recover the PCB by masking the kernel stack
//! pointer with [`PCB_MASK`]. The stacks are static so the geometry (and
//! with it the masking trick) holds for the whole kernel lifetime; the
//! pid bitmap decides which slots are live.

use core::arch::asm;
use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicU16, Ordering};

use spin::Mutex;
use x86_64::instructions::interrupts::without_interrupts;
use x86_64::PhysAddr;

use crate::paging;
use crate::userspace::file::FdTable;

/// Process identifier; 1-based, 0 means "no process".
pub type Pid = u16;

/// Upper bound on simultaneously live processes.
pub const MAX_PROCESSES: usize = 6;

/// Size of one kernel stack (and the alignment of all of them).
pub const KSTACK_SIZE: usize = 8192;

/// Masking any in-process kernel stack pointer with this yields the
/// address of the owning PCB.
pub const PCB_MASK: u64 = !((KSTACK_SIZE as u64) - 1);

/// Capacity of the command-line argument buffer.
pub const ARGS_LENGTH: usize = 128;

/// Exit status reported when a process dies by CPU exception.
pub const RETURN_EXCEPTION: i64 = 256;

/// Physical base of the per-pid user image slots (8 MiB).
pub const USER_IMAGE_PHYS_BASE: u64 = 0x80_0000;

/// End of the user image slots (8 MiB + 6 x 4 MiB).
pub const USER_IMAGE_PHYS_END: u64 =
    USER_IMAGE_PHYS_BASE + (MAX_PROCESSES as u64) * paging::USER_IMAGE_SIZE;

/// Kernel continuation of a descheduled process: the stack and frame
/// pointers captured by the switch primitive. Field order is fixed; the
/// naked functions in the scheduler and the userspace loader address the
/// two fields by offset.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelContext {
    /// Saved RSP, pointing at the callee-saved register frame.
    pub rsp: u64,
    /// Saved RBP.
    pub rbp: u64,
}

/// Process control block.
pub struct Pcb {
    /// This process's pid; also selects its kernel stack and image slot.
    pub pid: Pid,
    /// The process that executed this one; `None` for a root shell.
    pub parent: Option<Pid>,
    /// Index of the terminal this process belongs to.
    pub terminal: usize,
    /// Exit bookkeeping; [`RETURN_EXCEPTION`] when killed by a fault.
    pub retval: i64,
    /// Physical base of the 4 MiB image window.
    pub user_phys: PhysAddr,
    /// Virtual base the window is mapped at (always 128 MiB).
    pub user_virt: u64,
    /// Virtual address handed out by `vidmap`; 0 when unset.
    pub vidmap_addr: u64,
    /// Initial user stack pointer, just under the top of the window.
    pub user_rsp: u64,
    /// User frame pointer bookkeeping.
    pub user_rbp: u64,
    /// Kernel continuation: where this process resumes in kernel mode.
    /// While a child runs, this is the parent's `execute` resume point.
    pub kctx: KernelContext,
    /// Top of the kernel stack; written into TSS RSP0 when scheduled.
    pub esp0: u64,
    /// Open file table; entries 0 and 1 are bound for the lifetime.
    pub fds: FdTable,
    /// Command-line arguments, null-terminated.
    pub args: [u8; ARGS_LENGTH],
    /// Length of `args` excluding the terminator.
    pub args_len: usize,
}

impl Pcb {
    /// A fresh PCB for `pid` in `terminal`, with stdin/stdout bound and
    /// the image window pointed at the pid's slot.
    #[must_use]
    pub fn new(pid: Pid, terminal: usize, parent: Option<Pid>) -> Self {
        Self {
            pid,
            parent,
            terminal,
            retval: 0,
            user_phys: user_image_phys(pid),
            user_virt: paging::USER_IMAGE_VIRT,
            vidmap_addr: 0,
            user_rsp: crate::userspace::USER_STACK_TOP,
            user_rbp: crate::userspace::USER_STACK_TOP,
            kctx: KernelContext::default(),
            esp0: kernel_stack_top(pid).as_u64(),
            fds: FdTable::with_std(),
            args: [0; ARGS_LENGTH],
            args_len: 0,
        }
    }
}

/// Physical base of the image slot belonging to `pid`.
#[must_use]
pub fn user_image_phys(pid: Pid) -> PhysAddr {
    PhysAddr::new(USER_IMAGE_PHYS_BASE + u64::from(pid - 1) * paging::USER_IMAGE_SIZE)
}

#[repr(C, align(8192))]
struct KernelStack([u8; KSTACK_SIZE]);

const STACK_INIT: KernelStack = KernelStack([0; KSTACK_SIZE]);

/// One stack per pid slot; the PCB occupies the base of each.
static mut KERNEL_STACKS: [KernelStack; MAX_PROCESSES] = [STACK_INIT; MAX_PROCESSES];

// The PCB must leave most of the stack usable.
const _: () = assert!(core::mem::size_of::<Pcb>() <= KSTACK_SIZE / 4);

/// The PCB slot of `pid`, at the base of its kernel stack.
#[must_use]
pub fn pcb_ptr(pid: Pid) -> *mut Pcb {
    debug_assert!(pid >= 1 && pid as usize <= MAX_PROCESSES, "pid out of range");

    // SAFETY:
    // Taking the address of a static array element; no reference is
    // created here. Callers dereference only for live pids.
    unsafe { addr_of_mut!(KERNEL_STACKS[pid as usize - 1]).cast() }
}

/// Top of `pid`'s kernel stack, 16-byte aligned.
#[must_use]
pub fn kernel_stack_top(pid: Pid) -> x86_64::VirtAddr {
    let base = pcb_ptr(pid) as u64;
    x86_64::VirtAddr::new(base + KSTACK_SIZE as u64 - 16)
}

/// Write a fresh PCB into its stack-base slot and return the slot.
///
/// # Safety
/// The pid must be freshly allocated, so no live process uses the slot
/// or the stack above it.
pub unsafe fn install_pcb(pcb: Pcb) -> *mut Pcb {
    let slot = pcb_ptr(pcb.pid);
    slot.write(pcb);
    slot
}

static CURRENT_PID: AtomicU16 = AtomicU16::new(0);

/// Pid of the process owning the CPU; 0 during boot.
#[must_use]
pub fn current_pid() -> Pid {
    CURRENT_PID.load(Ordering::SeqCst)
}

/// Record the process owning the CPU. Called by `execute`, `halt` and
/// the scheduler, always with interrupts disabled.
pub fn set_current_pid(pid: Pid) {
    CURRENT_PID.store(pid, Ordering::SeqCst);
}

/// The PCB of the process this kernel code runs on behalf of, recovered
/// by masking the kernel stack pointer. `None` during boot, before the
/// first process exists.
#[must_use]
pub fn current_pcb() -> Option<*mut Pcb> {
    if current_pid() == 0 {
        return None;
    }

    let rsp: u64;
    // SAFETY:
    // Reading RSP has no side effects.
    unsafe {
        asm!("mov {}, rsp", out(reg) rsp, options(nomem, nostack, preserves_flags));
    }

    Some((rsp & PCB_MASK) as *mut Pcb)
}

/// Fixed-size pid bitmap. Allocation takes the first clear bit; freeing
/// a pid that is already free fails.
pub struct PidAllocator {
    used: [bool; MAX_PROCESSES],
}

impl PidAllocator {
    /// All pids free.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            used: [false; MAX_PROCESSES],
        }
    }

    /// Claim the smallest free pid.
    pub fn allocate(&mut self) -> Option<Pid> {
        for (index, slot) in self.used.iter_mut().enumerate() {
            if !*slot {
                *slot = true;
                return Some(index as Pid + 1);
            }
        }
        None
    }

    /// Release `pid`. Fails for out-of-range or already-free pids.
    ///
    /// # Errors
    /// Returns `Err(())` when `pid` is not currently allocated.
    pub fn free(&mut self, pid: Pid) -> Result<(), ()> {
        if pid == 0 || pid as usize > MAX_PROCESSES {
            return Err(());
        }
        if !self.used[pid as usize - 1] {
            return Err(());
        }
        self.used[pid as usize - 1] = false;
        Ok(())
    }

    /// Whether at least one pid is free.
    #[must_use]
    pub fn available(&self) -> bool {
        self.used.iter().any(|slot| !*slot)
    }

    /// Whether `pid` is currently allocated.
    #[must_use]
    pub fn is_allocated(&self, pid: Pid) -> bool {
        pid >= 1 && pid as usize <= MAX_PROCESSES && self.used[pid as usize - 1]
    }
}

impl Default for PidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

static PIDS: Mutex<PidAllocator> = Mutex::new(PidAllocator::new());

/// Claim the smallest free pid, or `None` when all six are live.
pub fn allocate_pid() -> Option<Pid> {
    without_interrupts(|| PIDS.lock().allocate())
}

/// Release a pid at process teardown.
///
/// # Errors
/// Returns `Err(())` when `pid` is not currently allocated.
pub fn free_pid(pid: Pid) -> Result<(), ()> {
    without_interrupts(|| PIDS.lock().free(pid))
}

/// Whether a new process could be created right now.
#[must_use]
pub fn pid_available() -> bool {
    without_interrupts(|| PIDS.lock().available())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_pid_allocator_round_trip() {
        let mut pids = PidAllocator::new();

        let first = pids.allocate().expect("first pid");
        let second = pids.allocate().expect("second pid");
        assert_ne!(first, second, "allocated pids must be distinct");
        assert!(pids.is_allocated(first), "a live pid reads as allocated");

        pids.free(first).expect("freeing a live pid succeeds");
        assert!(!pids.is_allocated(first), "a freed pid reads as free");
        assert_eq!(
            pids.allocate(),
            Some(first),
            "the smallest freed pid is handed out again",
        );
    }

    #[test_case]
    fn test_pid_allocator_exhaustion() {
        let mut pids = PidAllocator::new();

        for _ in 0..MAX_PROCESSES {
            assert!(pids.allocate().is_some(), "bitmap should have room");
        }
        assert_eq!(pids.allocate(), None, "seventh allocation must fail");
        assert!(!pids.available(), "no pid should be reported free");
    }

    #[test_case]
    fn test_pid_double_free_fails() {
        let mut pids = PidAllocator::new();
        let pid = pids.allocate().expect("pid");

        assert!(pids.free(pid).is_ok(), "first free succeeds");
        assert!(pids.free(pid).is_err(), "second free must fail");
        assert!(pids.free(0).is_err(), "pid 0 is never allocatable");
    }

    #[test_case]
    fn test_kernel_stacks_are_aligned_for_masking() {
        for pid in 1..=MAX_PROCESSES as Pid {
            let base = pcb_ptr(pid) as u64;
            assert_eq!(base & !PCB_MASK, 0, "stack base must be 8 KiB aligned");
            assert_eq!(
                kernel_stack_top(pid).as_u64() & PCB_MASK,
                base,
                "masking the stack top must recover the PCB",
            );
        }
    }
}
