//! Runtime configuration: the host runtime described by offsets.
//!
//! The engine never types the host runtime's structures. Everything it needs
//! to know about them — where a coroutine descriptor keeps its saved program
//! counter, where moduledata keeps the BSS base, where the world-stop entry
//! points live — arrives as flat `u64` offsets and unrelocated addresses in
//! this struct. Porting the engine to a new runtime revision means shipping a
//! new config, not new code.

/// Which world-stop binding revision the host runtime uses.
///
/// The stop/start entry points changed calling convention across runtime
/// revisions; the coordinator selects the matching binding. A version outside
/// this set is refused before any side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeVersion {
    /// Stop takes a reason code and returns nothing; start takes nothing.
    Legacy,
    /// Stop returns an opaque two-word handle that must be passed to start.
    Handled,
}

impl RuntimeVersion {
    /// Decode from the wire representation. Unknown values are unsupported.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(RuntimeVersion::Legacy),
            2 => Some(RuntimeVersion::Handled),
            _ => None,
        }
    }

    /// Wire representation.
    pub fn to_raw(self) -> u32 {
        match self {
            RuntimeVersion::Legacy => 1,
            RuntimeVersion::Handled => 2,
        }
    }
}

/// Flat description of the observed runtime.
///
/// All addresses are virtual addresses in the *unrelocated* binary; the
/// engine measures the load slide at snapshot time and rebases them. All
/// offsets are byte offsets into the named opaque structure.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    // =========================================================================
    // Coroutine descriptor offsets
    // =========================================================================
    /// Offset of the saved program counter (scheduler buffer).
    pub co_sched_pc_offset: u64,
    /// Offset of the saved frame pointer (scheduler buffer).
    pub co_sched_fp_offset: u64,
    /// Offset of the program counter recorded at syscall entry.
    pub co_syscall_pc_offset: u64,
    /// Offset of the 64-bit coroutine id.
    pub co_id_offset: u64,
    /// Offset of the atomic 32-bit status word.
    pub co_status_offset: u64,
    /// Offset of the highest stack address ever used by the coroutine.
    pub co_stack_top_sp_offset: u64,

    // =========================================================================
    // Moduledata
    // =========================================================================
    /// Unrelocated address of the first moduledata record.
    pub first_moduledata_addr: u64,
    /// Offset of the type-section start pointer within moduledata.
    pub moduledata_types_offset: u64,
    /// Offset of the type-section end pointer within moduledata.
    pub moduledata_etypes_offset: u64,
    /// Offset of the measured BSS base pointer within moduledata.
    pub moduledata_bss_offset: u64,

    // =========================================================================
    // Static variables (unrelocated addresses)
    // =========================================================================
    /// Declared BSS base address. Statics below are rebased against this.
    pub bss_addr: u64,
    /// Declared address of the coroutine-list header (`{ptr, len}`).
    pub coroutine_list_addr: u64,
    /// Declared address of the runtime's memory statistics record.
    pub memstats_addr: u64,
    /// Offset of the last-GC unix timestamp within the memstats record.
    pub mstats_last_gc_unix_offset: u64,

    // =========================================================================
    // World-stop entry points
    // =========================================================================
    /// Unrelocated entry address of the stop-the-world primitive.
    pub stop_the_world_addr: u64,
    /// Unrelocated entry address of the start-the-world primitive.
    pub start_the_world_addr: u64,
    /// Binding revision, see [`RuntimeVersion::from_raw`].
    pub runtime_version: u32,

    // =========================================================================
    // Safe-read primitive
    // =========================================================================
    /// Unrelocated start of the safe-read instruction range.
    pub safe_read_start_pc: u64,
    /// Unrelocated end (exclusive) of the safe-read instruction range.
    pub safe_read_end_pc: u64,
}

impl RuntimeConfig {
    /// Check that every address the engine dereferences unconditionally is
    /// present. Offsets may legitimately be zero; addresses may not.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stop_the_world_addr == 0 || self.start_the_world_addr == 0 {
            return Err(ConfigError::MissingWorldStopAddrs);
        }
        if self.coroutine_list_addr == 0 {
            return Err(ConfigError::MissingCoroutineList);
        }
        if self.bss_addr == 0 || self.first_moduledata_addr == 0 {
            return Err(ConfigError::MissingModuleAddrs);
        }
        if self.safe_read_start_pc >= self.safe_read_end_pc {
            return Err(ConfigError::BadSafeReadRange);
        }
        Ok(())
    }

    /// The rebased address of a static variable declared relative to BSS.
    ///
    /// `measured_bss` is the BSS base read out of moduledata at snapshot
    /// time; under ASLR it differs from [`RuntimeConfig::bss_addr`].
    #[inline]
    pub fn rebase_static(&self, declared: u64, measured_bss: u64) -> u64 {
        measured_bss.wrapping_add(declared.wrapping_sub(self.bss_addr))
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Stop or start entry address is zero.
    MissingWorldStopAddrs,
    /// Coroutine-list address is zero.
    MissingCoroutineList,
    /// BSS or moduledata address is zero.
    MissingModuleAddrs,
    /// Safe-read range is empty or inverted.
    BadSafeReadRange,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingWorldStopAddrs => {
                write!(f, "missing stop-the-world or start-the-world address")
            }
            ConfigError::MissingCoroutineList => write!(f, "missing coroutine list address"),
            ConfigError::MissingModuleAddrs => write!(f, "missing BSS or moduledata address"),
            ConfigError::BadSafeReadRange => write!(f, "safe-read range is empty or inverted"),
        }
    }
}

impl std::error::Error for ConfigError {}
