//! Type resolution.
//!
//! Interface cells carry absolute runtime-type addresses, which are useless
//! to a decoder looking at a different process image. Resolution happens in
//! two steps: the type address becomes a type-section-relative id (stable
//! across ASLR), and that id maps through the program's table to the
//! compact type id the bytecode speaks.

use gazer_program::SnapshotProgram;

/// Maps runtime type addresses into type-section-relative ids.
///
/// Built once per snapshot from the moduledata type-section bounds, read
/// while the world is already stopped.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeTypeResolver {
    range: Option<(u64, u64)>,
}

impl RuntimeTypeResolver {
    /// Resolver over the `[types, etypes)` section bounds; `None` when
    /// moduledata was unreadable (every address then resolves to 0).
    pub fn new(range: Option<(u64, u64)>) -> Self {
        Self { range }
    }

    /// Section-relative id for a runtime type address; 0 when the address
    /// lies outside the module's type section.
    #[inline]
    pub fn resolve(&self, addr: u64) -> u64 {
        match self.range {
            Some((start, end)) if addr >= start && addr < end => addr - start,
            _ => 0,
        }
    }
}

/// Resolve a runtime type address all the way to a compact type id.
///
/// Returns 0 when either step fails; 0 is never a valid compact id.
#[inline]
pub fn compact_id(
    types: &RuntimeTypeResolver,
    program: &SnapshotProgram,
    type_addr: u64,
) -> u32 {
    let runtime_id = types.resolve(type_addr);
    if runtime_id == 0 {
        return 0;
    }
    program.compact_type_id(runtime_id)
}
