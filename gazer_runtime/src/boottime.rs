//! Approximate system boot time.
//!
//! The decoder pairs monotonic readings with wall-clock times by adding
//! them to this base. On Linux the base is exact
//! (`CLOCK_REALTIME − CLOCK_MONOTONIC`). On Darwin the uptime clock stops
//! while the machine is suspended, so the returned value is not the real
//! boot time — it is only a lower-bound base for converting subsequent
//! monotonic readings, which is all the consumer needs.

use std::time::{Duration, SystemTime};

/// Boot-time acquisition failures.
#[derive(Debug)]
pub enum BootTimeError {
    /// No implementation for this platform; callers send nothing.
    NotImplemented,
    /// The platform clock could not be read.
    Clock(std::io::Error),
}

impl std::fmt::Display for BootTimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootTimeError::NotImplemented => write!(f, "not implemented"),
            BootTimeError::Clock(e) => write!(f, "failed to read clock: {}", e),
        }
    }
}

impl std::error::Error for BootTimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BootTimeError::Clock(e) => Some(e),
            BootTimeError::NotImplemented => None,
        }
    }
}

/// The approximate boot time of the system.
pub fn boot_time() -> Result<SystemTime, BootTimeError> {
    boot_time_impl()
}

#[cfg(target_os = "linux")]
fn clock_ns(clock: libc::clockid_t) -> Result<i128, BootTimeError> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-pointer for clock_gettime.
    let rc = unsafe { libc::clock_gettime(clock, &mut ts) };
    if rc != 0 {
        return Err(BootTimeError::Clock(std::io::Error::last_os_error()));
    }
    Ok(ts.tv_sec as i128 * 1_000_000_000 + ts.tv_nsec as i128)
}

#[cfg(target_os = "linux")]
fn boot_time_impl() -> Result<SystemTime, BootTimeError> {
    let monotonic = clock_ns(libc::CLOCK_MONOTONIC)?;
    let wall = clock_ns(libc::CLOCK_REALTIME)?;
    let base = wall - monotonic;
    if base < 0 {
        // Wall clock before the epoch; nothing sensible to report.
        return Err(BootTimeError::NotImplemented);
    }
    Ok(SystemTime::UNIX_EPOCH + Duration::from_nanos(base as u64))
}

#[cfg(target_os = "macos")]
fn boot_time_impl() -> Result<SystemTime, BootTimeError> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_UPTIME_RAW matches the host runtime's monotonic source; it
    // stops during suspend, hence "approximate".
    // SAFETY: ts is a valid out-pointer for clock_gettime.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_UPTIME_RAW, &mut ts) };
    if rc != 0 {
        return Err(BootTimeError::Clock(std::io::Error::last_os_error()));
    }
    let uptime =
        Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32);
    SystemTime::now()
        .checked_sub(uptime)
        .ok_or(BootTimeError::NotImplemented)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn boot_time_impl() -> Result<SystemTime, BootTimeError> {
    Err(BootTimeError::NotImplemented)
}
