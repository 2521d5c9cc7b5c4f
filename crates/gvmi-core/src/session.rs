use std::{cell::RefCell, collections::HashMap, num::NonZeroUsize};

use lru::LruCache;

use crate::{
    AccessContext, Pa, ProcessId, Va, VmiCore, VmiDriver, VmiError, VmiMappedPage, VmiOs,
    os::OsProcess,
};

/// Default capacity of the pid→dtb cache.
const PID_CACHE_SIZE: usize = 1024;

/// Key of a per-process symbol cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SymbolKey {
    base: Va,
    pid: ProcessId,
    name: String,
}

/// Key of a per-process rva→symbol cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct RvaKey {
    base: Va,
    pid: ProcessId,
    rva: u64,
}

/// A VMI session: a [`VmiCore`] coupled with an OS-specific view.
///
/// The session resolves the symbolic addressing forms (process id, kernel
/// symbol) down to the `(va, dtb)` pairs the core understands, and owns the
/// OS-level translation caches: symbol, rva and pid→dtb.
pub struct VmiSession<'a, Driver, Os>
where
    Driver: VmiDriver,
    Os: VmiOs<Driver>,
{
    core: &'a VmiCore<Driver>,
    os: &'a Os,

    symbol_cache: RefCell<HashMap<SymbolKey, Va>>,
    rva_cache: RefCell<HashMap<RvaKey, String>>,
    pid_cache: RefCell<LruCache<ProcessId, Pa>>,
}

impl<Driver, Os> std::ops::Deref for VmiSession<'_, Driver, Os>
where
    Driver: VmiDriver,
    Os: VmiOs<Driver>,
{
    type Target = VmiCore<Driver>;

    fn deref(&self) -> &Self::Target {
        self.core
    }
}

impl<'a, Driver, Os> VmiSession<'a, Driver, Os>
where
    Driver: VmiDriver,
    Os: VmiOs<Driver>,
{
    /// Creates a new VMI session.
    pub fn new(core: &'a VmiCore<Driver>, os: &'a Os) -> Self {
        Self {
            core,
            os,
            symbol_cache: RefCell::new(HashMap::new()),
            rva_cache: RefCell::new(HashMap::new()),
            pid_cache: RefCell::new(LruCache::new(NonZeroUsize::new(PID_CACHE_SIZE).unwrap())),
        }
    }

    /// Returns the VMI core.
    pub fn core(&self) -> &VmiCore<Driver> {
        self.core
    }

    /// Returns the underlying OS-specific implementation.
    pub fn os(&self) -> &Os {
        self.os
    }

    /// Completes instance initialization: runs the OS-specific discovery
    /// and leaves the core with a consistent `kpgd`/`page_mode`.
    pub fn complete_init(&self) -> Result<(), VmiError> {
        self.os.init(self.core)
    }

    //
    // OS-level caches
    //

    /// Clears the symbol cache.
    pub fn flush_symbol_cache(&self) {
        self.symbol_cache.borrow_mut().clear();
    }

    /// Clears the rva→symbol cache.
    pub fn flush_rva_cache(&self) {
        self.rva_cache.borrow_mut().clear();
    }

    /// Clears the pid→dtb cache.
    pub fn flush_pid_cache(&self) {
        self.pid_cache.borrow_mut().clear();
    }

    /// Flushes every cache owned by the session and the core.
    pub fn flush_caches(&self) {
        self.flush_symbol_cache();
        self.flush_rva_cache();
        self.flush_pid_cache();
        self.core.flush_caches();
    }

    //
    // Snapshot lifecycle
    //

    /// Converts the live VM into the snapshot view.
    ///
    /// Every cache is flushed, the session-level symbol, rva and pid
    /// caches included: entries resolved against the live VM may predate
    /// the freeze.
    pub fn snapshot_create(&self) -> Result<(), VmiError> {
        self.flush_caches();
        self.core.snapshot_create()
    }

    /// Tears the snapshot down and restores live access, flushing every
    /// cache again.
    pub fn snapshot_destroy(&self) -> Result<(), VmiError> {
        let result = self.core.snapshot_destroy();
        self.flush_symbol_cache();
        self.flush_rva_cache();
        self.flush_pid_cache();
        result
    }

    //
    // Symbolic resolution
    //

    /// Maps a process id to its directory table base.
    ///
    /// Results are cached; failures never are.
    pub fn pid_to_dtb(&self, pid: ProcessId) -> Result<Pa, VmiError> {
        if let Some(dtb) = self.pid_cache.borrow_mut().get(&pid) {
            return Ok(*dtb);
        }

        let dtb = self.os.pid_to_pgd(self.core, pid)?;
        self.pid_cache.borrow_mut().put(pid, dtb);
        Ok(dtb)
    }

    /// Maps a directory table base back to the owning process id.
    pub fn dtb_to_pid(&self, dtb: Pa) -> Result<ProcessId, VmiError> {
        self.os.pgd_to_pid(self.core, dtb)
    }

    /// Resolves a kernel symbol to a kernel virtual address.
    ///
    /// Resolved addresses are cached for the lifetime of the session.
    pub fn ksym_to_va(&self, symbol: &str) -> Result<Va, VmiError> {
        let key = SymbolKey {
            base: Va(0),
            pid: ProcessId::KERNEL,
            name: symbol.to_string(),
        };

        if let Some(va) = self.symbol_cache.borrow().get(&key) {
            return Ok(*va);
        }

        let va = self.os.ksym_to_va(self.core, symbol)?;
        self.symbol_cache.borrow_mut().insert(key, va);
        Ok(va)
    }

    /// Records a resolved per-process symbol in the symbol cache.
    pub fn cache_symbol(&self, base: Va, pid: ProcessId, name: &str, va: Va) {
        self.symbol_cache.borrow_mut().insert(
            SymbolKey {
                base,
                pid,
                name: name.to_string(),
            },
            va,
        );
    }

    /// Looks up a cached per-process symbol.
    pub fn cached_symbol(&self, base: Va, pid: ProcessId, name: &str) -> Option<Va> {
        self.symbol_cache
            .borrow()
            .get(&SymbolKey {
                base,
                pid,
                name: name.to_string(),
            })
            .copied()
    }

    /// Records a resolved rva→symbol mapping in the rva cache.
    pub fn cache_rva(&self, base: Va, pid: ProcessId, rva: u64, name: &str) {
        self.rva_cache
            .borrow_mut()
            .insert(RvaKey { base, pid, rva }, name.to_string());
    }

    /// Looks up a cached rva→symbol mapping.
    pub fn cached_rva(&self, base: Va, pid: ProcessId, rva: u64) -> Option<String> {
        self.rva_cache
            .borrow()
            .get(&RvaKey { base, pid, rva })
            .cloned()
    }

    /// Translates a user virtual address through a process's pagetables.
    pub fn translate_uv2p(&self, va: Va, pid: ProcessId) -> Result<Pa, VmiError> {
        let dtb = self.pid_to_dtb(pid)?;
        self.core.translate((va, dtb))
    }

    /// Translates a kernel symbol to its physical address.
    pub fn translate_ksym2p(&self, symbol: &str) -> Result<Pa, VmiError> {
        let va = self.ksym_to_va(symbol)?;
        self.core.translate_kv2p(va)
    }

    //
    // Symbolic reads
    //

    /// Reads memory from a process's virtual address space.
    pub fn read_pid(&self, va: Va, pid: ProcessId, buffer: &mut [u8]) -> Result<(), VmiError> {
        let dtb = self.pid_to_dtb(pid)?;
        self.core.read((va, dtb), buffer)
    }

    /// Reads memory at a kernel symbol.
    pub fn read_ksym(&self, symbol: &str, buffer: &mut [u8]) -> Result<(), VmiError> {
        let va = self.ksym_to_va(symbol)?;
        self.core.read(AccessContext::kernel(va), buffer)
    }

    /// Enumerates the guest's kernel process list.
    pub fn processes(&self) -> Result<Vec<OsProcess>, VmiError> {
        self.os.processes(self.core)
    }

    /// Decodes a guest OS Unicode-string structure in a process's address
    /// space.
    pub fn read_unicode_string(&self, va: Va, pid: ProcessId) -> Result<String, VmiError> {
        let dtb = self.pid_to_dtb(pid)?;
        self.os
            .read_unicode_string(self.core, crate::AddressContext::new(va, dtb))
    }

    //
    // Direct (zero-copy) access
    //

    /// Direct guest virtual memory access (dgvma).
    ///
    /// Returns a zero-copy slice handle covering `va` and the usable length,
    /// which runs from `va` to the end of the containing v2m chunk (or
    /// `count`, whichever is smaller). Callers iterate to traverse runs
    /// spanning multiple chunks.
    ///
    /// The v2m table for the pid is constructed on first use: the pid is
    /// resolved to its dtb, every mapped page under that dtb is enumerated,
    /// and the driver builds the host-side mappings.
    pub fn dgvma(
        &self,
        va: Va,
        pid: ProcessId,
        count: usize,
    ) -> Result<(VmiMappedPage, usize), VmiError> {
        if let Some(found) = self.core.driver().direct_virtual(pid, va, count)? {
            return Ok(found);
        }

        let dtb = if pid == ProcessId::KERNEL {
            let kpgd = self.core.kpgd();
            if kpgd.is_null() {
                return Err(VmiError::NotInitialized);
            }
            kpgd
        } else {
            self.pid_to_dtb(pid)?
        };

        let pages = self.core.va_pages(dtb)?;
        self.core.driver().insert_virtual_mappings(pid, &pages)?;

        match self.core.driver().direct_virtual(pid, va, count)? {
            Some(found) => Ok(found),
            None => Err(VmiError::page_fault((va, dtb))),
        }
    }
}
