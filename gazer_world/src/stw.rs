//! Stop-the-world coordination.
//!
//! [`stop_the_world`] runs a closure with every other coroutine of the host
//! runtime halted at a safe point. The body must not panic, allocate from
//! the host runtime, perform I/O, or block; when it wants to read unsafe
//! memory it must use [`crate::try_read`], which cooperates with the signal
//! handler installed here.
//!
//! The halt primitive itself belongs to the host runtime; its entry points
//! arrive as unrelocated addresses in the runtime config and changed
//! calling convention across runtime revisions, so they are invoked through
//! one internal binding interface with a per-revision implementation.

use std::mem;

use gazer_program::{ConfigError, RuntimeConfig, RuntimeVersion};
use parking_lot::Mutex;

use crate::platform;
use crate::safe_read;
use crate::signal;

/// Errors refusing a world stop. All are returned before any side effect.
#[derive(Debug)]
pub enum WorldError {
    /// OS/architecture outside the support matrix.
    PlatformUnsupported,
    /// The program declared a binding revision this build does not know.
    RuntimeVersionUnsupported(u32),
    /// The runtime config is missing required addresses.
    Config(ConfigError),
    /// Swapping the signal handler failed.
    HandlerInstall(std::io::Error),
}

impl std::fmt::Display for WorldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorldError::PlatformUnsupported => {
                write!(f, "OS/architecture combination not supported")
            }
            WorldError::RuntimeVersionUnsupported(v) => {
                write!(f, "runtime version {} not supported", v)
            }
            WorldError::Config(e) => write!(f, "invalid runtime config: {}", e),
            WorldError::HandlerInstall(e) => write!(f, "failed to install signal handler: {}", e),
        }
    }
}

impl std::error::Error for WorldError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorldError::Config(e) => Some(e),
            WorldError::HandlerInstall(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for WorldError {
    fn from(e: ConfigError) -> Self {
        WorldError::Config(e)
    }
}

/// Only one snapshot may stop the world at a time, process-wide.
static WORLD_LOCK: Mutex<()> = Mutex::new(());

/// Opaque token the newer halt primitive returns and the resume primitive
/// consumes. Layout dictated by the host runtime.
#[repr(C)]
#[derive(Clone, Copy)]
struct WorldHandle {
    reason: i8,
    start_ns: i64,
}

/// Reason code reported to the host runtime for the pause.
const HALT_REASON: i8 = 10;

/// One binding per runtime revision; see [`RuntimeVersion`].
enum Binding {
    /// Halt takes a reason and returns nothing; resume takes nothing.
    Legacy {
        stop: unsafe extern "C" fn(i8),
        start: unsafe extern "C" fn(),
    },
    /// Halt returns a handle that resume consumes.
    Handled {
        stop: unsafe extern "C" fn(i8) -> WorldHandle,
        start: unsafe extern "C" fn(WorldHandle),
    },
}

impl Binding {
    /// Bind the relocated entry addresses for the declared revision.
    ///
    /// # Safety
    ///
    /// The addresses must be the entry points of the host runtime's halt
    /// and resume primitives for exactly this revision.
    unsafe fn from_config(version: RuntimeVersion, stop_addr: usize, start_addr: usize) -> Binding {
        match version {
            // SAFETY: per contract, the addresses carry these signatures.
            RuntimeVersion::Legacy => unsafe {
                Binding::Legacy {
                    stop: mem::transmute::<usize, unsafe extern "C" fn(i8)>(stop_addr),
                    start: mem::transmute::<usize, unsafe extern "C" fn()>(start_addr),
                }
            },
            // SAFETY: per contract, the addresses carry these signatures.
            RuntimeVersion::Handled => unsafe {
                Binding::Handled {
                    stop: mem::transmute::<usize, unsafe extern "C" fn(i8) -> WorldHandle>(
                        stop_addr,
                    ),
                    start: mem::transmute::<usize, unsafe extern "C" fn(WorldHandle)>(start_addr),
                }
            },
        }
    }

    unsafe fn stop(&self) -> Option<WorldHandle> {
        match self {
            // SAFETY: bound per contract in from_config.
            Binding::Legacy { stop, .. } => unsafe {
                stop(HALT_REASON);
                None
            },
            // SAFETY: bound per contract in from_config.
            Binding::Handled { stop, .. } => unsafe { Some(stop(HALT_REASON)) },
        }
    }

    unsafe fn start(&self, handle: Option<WorldHandle>) {
        match (self, handle) {
            // SAFETY: bound per contract in from_config.
            (Binding::Legacy { start, .. }, _) => unsafe { start() },
            // SAFETY: bound per contract in from_config.
            (Binding::Handled { start, .. }, Some(h)) => unsafe { start(h) },
            (Binding::Handled { .. }, None) => unreachable!("handled stop returned no handle"),
        }
    }
}

/// Run `body` with the world stopped.
///
/// The calling thread stays on its OS thread for the duration (std threads
/// are OS threads; no pinning call is needed). Refuses with no side effects
/// when the platform, the binding revision, or the config is unsupported.
/// The body must not panic: there is no recovery path that leaves the world
/// stopped, so a panic aborts the process.
pub fn stop_the_world<F: FnOnce()>(cfg: &RuntimeConfig, body: F) -> Result<(), WorldError> {
    platform::platform_supported()?;
    let version = platform::runtime_version(cfg.runtime_version)?;
    cfg.validate()?;

    #[cfg(unix)]
    {
        let _guard = WORLD_LOCK.lock();

        let base = safe_read::relocation_base(cfg);
        signal::publish_range(
            cfg.safe_read_start_pc.wrapping_add(base) as usize,
            cfg.safe_read_end_pc.wrapping_add(base) as usize,
        );
        signal::install_handler().map_err(|e| {
            signal::clear_range();
            WorldError::HandlerInstall(e)
        })?;

        // SAFETY: the config declared these entry points for this revision;
        // validate() checked they are present.
        let binding = unsafe {
            Binding::from_config(
                version,
                cfg.stop_the_world_addr.wrapping_add(base) as usize,
                cfg.start_the_world_addr.wrapping_add(base) as usize,
            )
        };

        // SAFETY: world-stop mutex held, handler installed.
        let handle = unsafe { binding.stop() };
        body();
        // SAFETY: resumes the stop performed above.
        unsafe { binding.start(handle) };

        signal::restore_handler();
        signal::clear_range();
        Ok(())
    }
    #[cfg(not(unix))]
    {
        // platform_supported() already refused.
        let _ = (version, body);
        Err(WorldError::PlatformUnsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usable_config() -> RuntimeConfig {
        RuntimeConfig {
            stop_the_world_addr: 0x1000,
            start_the_world_addr: 0x1100,
            coroutine_list_addr: 0x2000,
            bss_addr: 0x3000,
            first_moduledata_addr: 0x4000,
            safe_read_start_pc: 0x500,
            safe_read_end_pc: 0x540,
            runtime_version: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_refuses_unknown_runtime_version() {
        let cfg = RuntimeConfig {
            runtime_version: 42,
            ..usable_config()
        };
        let mut ran = false;
        let err = stop_the_world(&cfg, || ran = true).unwrap_err();
        assert!(matches!(err, WorldError::RuntimeVersionUnsupported(42)));
        assert!(!ran, "body must not run when refused");
    }

    #[test]
    fn test_refuses_invalid_config() {
        let cfg = RuntimeConfig {
            stop_the_world_addr: 0,
            ..usable_config()
        };
        let mut ran = false;
        let err = stop_the_world(&cfg, || ran = true).unwrap_err();
        assert!(matches!(err, WorldError::Config(_)));
        assert!(!ran, "body must not run when refused");
    }
}
