//! SIGSEGV handling for safe reads.
//!
//! A process-wide singleton publishes the safe-read instruction range and a
//! recovery point. The installed handler checks the faulting PC: inside the
//! range with an armed recovery point, it jumps back into [`crate::try_read`]
//! which then reports failure; anywhere else it chains to the previously
//! installed action, so unrelated crashes stay fatal as normal.
//!
//! # Async-Signal-Safety
//!
//! The handler only performs atomic loads/stores, reads of state that is
//! mutated exclusively while the world-stop mutex is held (and therefore
//! quiescent when a fault can occur), and `siglongjmp` — all permitted in
//! signal context. No allocation, no locking, no I/O.

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::mem;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

// =============================================================================
// sigsetjmp / siglongjmp FFI
// =============================================================================

/// Opaque save buffer for `sigsetjmp`.
///
/// Over-allocated relative to every supported platform's `sigjmp_buf`
/// (200 bytes on x86_64 glibc, 392 on aarch64 glibc, 196 on Darwin).
#[repr(C, align(16))]
pub struct SigJmpBuf {
    _buf: [u8; 512],
}

impl SigJmpBuf {
    const fn zeroed() -> Self {
        Self { _buf: [0u8; 512] }
    }
}

#[cfg(unix)]
unsafe extern "C" {
    // On glibc, sigsetjmp is a macro expanding to __sigsetjmp. On macOS it
    // is the actual symbol.
    #[cfg_attr(target_os = "linux", link_name = "__sigsetjmp")]
    pub(crate) fn sigsetjmp(env: *mut SigJmpBuf, savemask: libc::c_int) -> libc::c_int;
    fn siglongjmp(env: *mut SigJmpBuf, val: libc::c_int) -> !;
}

// =============================================================================
// Signal-state singleton
// =============================================================================

/// Shared state between the world-stop coordinator, the safe-read primitive,
/// and the signal handler.
///
/// Mutated only while the world-stop mutex is held; the handler reads it
/// racy-free because the mutating thread is the only thread running.
pub(crate) struct SignalState {
    /// Relocated start of the safe-read instruction range.
    deref_start: AtomicUsize,
    /// Relocated end (exclusive) of the safe-read instruction range.
    deref_end: AtomicUsize,
    /// Recovery point armed by `try_read` around the copy.
    jmp_buf: UnsafeCell<SigJmpBuf>,
    /// Whether `jmp_buf` currently holds a valid recovery point.
    jmp_buf_valid: AtomicBool,
    /// Previously installed SIGSEGV action; chained to for foreign faults.
    #[cfg(unix)]
    prev_segv: UnsafeCell<MaybeUninit<libc::sigaction>>,
    /// Previously installed SIGBUS action (Darwin delivers bad reads there).
    #[cfg(target_os = "macos")]
    prev_bus: UnsafeCell<MaybeUninit<libc::sigaction>>,
    /// Whether our handler is currently installed.
    installed: AtomicBool,
}

// SAFETY: the UnsafeCell fields are only written while the world-stop mutex
// serializes all mutators, and only read by the handler on the same thread
// that armed them.
unsafe impl Sync for SignalState {}

#[cfg(unix)]
static STATE: SignalState = SignalState {
    deref_start: AtomicUsize::new(0),
    deref_end: AtomicUsize::new(0),
    jmp_buf: UnsafeCell::new(SigJmpBuf::zeroed()),
    jmp_buf_valid: AtomicBool::new(false),
    prev_segv: UnsafeCell::new(MaybeUninit::zeroed()),
    #[cfg(target_os = "macos")]
    prev_bus: UnsafeCell::new(MaybeUninit::zeroed()),
    installed: AtomicBool::new(false),
};

/// Publish the relocated safe-read range.
#[cfg(unix)]
pub(crate) fn publish_range(start: usize, end: usize) {
    STATE.deref_start.store(start, Ordering::Release);
    STATE.deref_end.store(end, Ordering::Release);
}

/// Clear the published range.
#[cfg(unix)]
pub(crate) fn clear_range() {
    STATE.deref_start.store(0, Ordering::Release);
    STATE.deref_end.store(0, Ordering::Release);
}

/// Whether a PC lies inside the published range.
#[cfg(unix)]
#[inline]
pub(crate) fn pc_in_range(pc: usize) -> bool {
    let start = STATE.deref_start.load(Ordering::Acquire);
    if start == 0 {
        return false;
    }
    pc >= start && pc < STATE.deref_end.load(Ordering::Acquire)
}

/// The recovery buffer `try_read` saves into.
#[cfg(unix)]
pub(crate) fn jmp_buf_ptr() -> *mut SigJmpBuf {
    STATE.jmp_buf.get()
}

/// Arm or disarm the recovery point.
#[cfg(unix)]
pub(crate) fn set_recovery_armed(armed: bool) {
    STATE.jmp_buf_valid.store(armed, Ordering::Release);
}

// =============================================================================
// Handler install / restore
// =============================================================================

/// Install the recovery handler, saving the previous action for chaining.
///
/// Must be called with the world-stop mutex held.
#[cfg(unix)]
pub(crate) fn install_handler() -> Result<(), std::io::Error> {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = segv_handler
            as extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void)
            as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_NODEFER;
        libc::sigemptyset(&mut action.sa_mask);

        if libc::sigaction(libc::SIGSEGV, &action, STATE.prev_segv.get().cast()) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        #[cfg(target_os = "macos")]
        if libc::sigaction(libc::SIGBUS, &action, STATE.prev_bus.get().cast()) != 0 {
            libc::sigaction(libc::SIGSEGV, STATE.prev_segv.get().cast(), ptr::null_mut());
            return Err(std::io::Error::last_os_error());
        }
    }
    STATE.installed.store(true, Ordering::Release);
    Ok(())
}

/// Restore the previously installed action(s).
///
/// Must be called with the world-stop mutex held.
#[cfg(unix)]
pub(crate) fn restore_handler() {
    if !STATE.installed.swap(false, Ordering::AcqRel) {
        return;
    }
    unsafe {
        libc::sigaction(libc::SIGSEGV, STATE.prev_segv.get().cast(), ptr::null_mut());
        #[cfg(target_os = "macos")]
        libc::sigaction(libc::SIGBUS, STATE.prev_bus.get().cast(), ptr::null_mut());
    }
}

// =============================================================================
// The handler
// =============================================================================

/// Extract the faulting program counter from the saved thread context.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn fault_pc(context: *mut c_void) -> usize {
    let uc = context as *mut libc::ucontext_t;
    // SAFETY: the kernel hands the handler a valid ucontext_t.
    unsafe { (*uc).uc_mcontext.gregs[libc::REG_RIP as usize] as usize }
}

/// Extract the faulting program counter from the saved thread context.
#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn fault_pc(context: *mut c_void) -> usize {
    let uc = context as *mut libc::ucontext_t;
    // SAFETY: the kernel hands the handler a valid ucontext_t.
    unsafe { (*uc).uc_mcontext.pc as usize }
}

/// Extract the faulting program counter from the saved thread context.
#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
unsafe fn fault_pc(context: *mut c_void) -> usize {
    let uc = context as *mut libc::ucontext_t;
    // SAFETY: the kernel hands the handler a valid ucontext_t.
    unsafe { (*(*uc).uc_mcontext).__ss.__pc as usize }
}

/// Fallback for unix targets outside the support matrix: never recover.
#[cfg(all(
    unix,
    not(any(
        all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")),
        all(target_os = "macos", target_arch = "aarch64"),
    ))
))]
unsafe fn fault_pc(_context: *mut c_void) -> usize {
    0
}

#[cfg(unix)]
extern "C" fn segv_handler(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut c_void,
) {
    // SAFETY: context is the ucontext_t the kernel handed us.
    let pc = unsafe { fault_pc(context) };

    if pc_in_range(pc) && STATE.jmp_buf_valid.load(Ordering::Acquire) {
        // Disarm before jumping so a fault on the recovery path itself is
        // not caught again.
        STATE.jmp_buf_valid.store(false, Ordering::Release);
        // SAFETY: the buffer was filled by sigsetjmp in try_read on this
        // same thread and that frame is still live (the copy runs inside
        // it). siglongjmp restores the signal mask sigsetjmp saved.
        unsafe { siglongjmp(STATE.jmp_buf.get(), 1) };
    }

    // Not our fault: hand it to whoever was installed before us.
    unsafe { chain_to_previous(sig, info, context) };
}

/// Invoke the previously installed action for `sig`.
#[cfg(unix)]
unsafe fn chain_to_previous(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut c_void,
) {
    let prev: *const libc::sigaction = match sig {
        libc::SIGSEGV => STATE.prev_segv.get().cast(),
        #[cfg(target_os = "macos")]
        libc::SIGBUS => STATE.prev_bus.get().cast(),
        _ => ptr::null(),
    };
    if prev.is_null() {
        // SAFETY: _exit is async-signal-safe.
        unsafe { libc::_exit(128 + sig) };
    }
    // SAFETY: prev points at the saved action, quiescent during handling.
    let prev = unsafe { &*prev };
    let handler = prev.sa_sigaction;

    if handler == libc::SIG_IGN {
        return;
    }
    if handler == libc::SIG_DFL {
        // Reinstall the default action and return; the faulting instruction
        // re-executes and the default disposition terminates the process.
        unsafe { libc::sigaction(sig, prev, ptr::null_mut()) };
        return;
    }
    if prev.sa_flags & libc::SA_SIGINFO != 0 {
        // SAFETY: the saved action declared a three-argument handler.
        let f: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void) =
            unsafe { mem::transmute(handler) };
        f(sig, info, context);
    } else {
        // SAFETY: the saved action declared a one-argument handler.
        let f: extern "C" fn(libc::c_int) = unsafe { mem::transmute(handler) };
        f(sig);
    }
}
