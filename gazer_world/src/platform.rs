//! Support matrix checks.
//!
//! Every check here runs before the world stops and before any handler is
//! swapped; an unsupported combination is refused with zero side effects.

use gazer_program::RuntimeVersion;

use crate::stw::WorldError;

/// Whether this OS/architecture combination has a working signal-recovery
/// and CFA-adjustment story.
pub fn os_arch_supported() -> bool {
    cfg!(any(
        all(
            target_os = "linux",
            any(target_arch = "x86_64", target_arch = "aarch64")
        ),
        all(target_os = "macos", target_arch = "aarch64"),
    ))
}

/// Refuse unsupported platforms.
pub fn platform_supported() -> Result<(), WorldError> {
    if !os_arch_supported() {
        return Err(WorldError::PlatformUnsupported);
    }
    Ok(())
}

/// Resolve the world-stop binding revision declared by the program.
pub fn runtime_version(raw: u32) -> Result<RuntimeVersion, WorldError> {
    RuntimeVersion::from_raw(raw).ok_or(WorldError::RuntimeVersionUnsupported(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_versions_resolve() {
        assert_eq!(runtime_version(1).unwrap(), RuntimeVersion::Legacy);
        assert_eq!(runtime_version(2).unwrap(), RuntimeVersion::Handled);
    }

    #[test]
    fn test_unknown_version_is_refused() {
        assert!(matches!(
            runtime_version(0),
            Err(WorldError::RuntimeVersionUnsupported(0))
        ));
        assert!(matches!(
            runtime_version(77),
            Err(WorldError::RuntimeVersionUnsupported(77))
        ));
    }
}
