//! SIGSEGV glue: the host-facing trap that forwards fault addresses to the
//! active session.
//!
//! Fault delivery is deliberately decoupled from fault resolution. The
//! resolver ([`LoaderSession::handle_fault`]) is an ordinary method driven by
//! an address; this module is the only code that knows faults arrive as
//! signals. The slot below exists because a signal action cannot capture
//! state, and it bounds the design to one session per process lifetime.

use std::cell::UnsafeCell;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::loader::LoaderSession;
use crate::pages::MmapMapper;
use crate::{LoaderError, Result};

/// Process-wide slot holding the session the signal action resolves against.
struct TrapSlot(UnsafeCell<Option<LoaderSession<MmapMapper>>>);

// SAFETY: the loader is single-threaded by contract. The slot is written by
// `install` before the target runs and read only by the signal action while
// the target runs and by `take` after it returns; the accesses never overlap.
unsafe impl Sync for TrapSlot {}

static SLOT: TrapSlot = TrapSlot(UnsafeCell::new(None));
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install `session` as the process's fault target and arm the SIGSEGV
/// action.
///
/// # Errors
///
/// `AlreadyActive` if a session was installed earlier in this process's
/// lifetime; `Io` if the kernel rejects the signal action.
pub fn install(session: LoaderSession<MmapMapper>) -> Result<()> {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Err(LoaderError::AlreadyActive);
    }
    // SAFETY: no signal action references the slot before `sigaction` below
    // succeeds, and `INSTALLED` keeps any second writer out.
    unsafe { *SLOT.0.get() = Some(session) };

    // SAFETY: `action` is fully initialized before the call: cleared mask,
    // SA_SIGINFO flag, and a handler with the three-argument signature.
    unsafe {
        let mut action: libc::sigaction = core::mem::zeroed();
        libc::sigemptyset(&raw mut action.sa_mask);
        action.sa_flags = libc::SA_SIGINFO;
        action.sa_sigaction = on_fault as usize;
        if libc::sigaction(libc::SIGSEGV, &raw const action, core::ptr::null_mut()) == -1 {
            return Err(LoaderError::Io(io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Reclaim the session after the target has returned, for teardown and
/// stats reporting.
#[must_use]
pub fn take() -> Option<LoaderSession<MmapMapper>> {
    // SAFETY: the target has returned, so no fault can race this access.
    unsafe { (*SLOT.0.get()).take() }
}

/// The SIGSEGV action: resolve the fault through the active session or
/// terminate with the cause.
///
/// Resuming after a failed resolution would re-execute the faulting access
/// forever, so any resolver error ends the process here.
extern "C" fn on_fault(_signum: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    // SAFETY: the kernel passes a valid siginfo_t to SA_SIGINFO actions.
    let fault_addr = unsafe { (*info).si_addr() } as usize;

    let Ok(addr) = u32::try_from(fault_addr) else {
        // A 32-bit image cannot own an address above 4 GiB; this is a wild
        // access by the target, not a resolvable fault.
        eprintln!("fatal fault outside the 32-bit address space: {fault_addr:#x}");
        // SAFETY: _exit is async-signal-safe.
        unsafe { libc::_exit(1) };
    };

    // SAFETY: single-threaded; `install` filled the slot before any fault
    // could be delivered, and `take` only runs after the target returned.
    let slot = unsafe { &mut *SLOT.0.get() };
    let outcome = match slot.as_mut() {
        Some(session) => session.handle_fault(addr),
        None => Err(LoaderError::NoSegment { addr }),
    };

    if let Err(err) = outcome {
        eprintln!("fatal fault at {addr:#010x}: {err}");
        // SAFETY: _exit is async-signal-safe.
        unsafe { libc::_exit(1) };
    }
}
