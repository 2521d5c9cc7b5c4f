//! Core guest-memory introspection functionality.

pub mod arch;
mod config;
mod core;
mod driver;
mod error;
mod event;
mod os;
mod page;
mod session;

#[cfg(test)]
mod tests;

use std::{
    cell::{Cell, RefCell},
    num::NonZeroUsize,
    time::Duration,
};

use lru::LruCache;
use zerocopy::{FromBytes, IntoBytes};

pub use self::{
    arch::{Architecture, PageMode, Registers},
    config::{LinuxConfig, VmiConfig, VmiFlags, WindowsConfig},
    core::{
        AccessContext, AddressContext, Gfn, MemoryAccess, Pa, PageInfo, PageTableEntryInfo,
        TranslationMechanism, Va, VaPage, VcpuId, VmiInfo,
    },
    driver::VmiDriver,
    error::{PageFaults, VmiError},
    event::{VmiEvent, VmiEventResponse, VmiEventResponseFlags},
    os::{OsProcess, OsType, ProcessId, VmiOs},
    page::VmiMappedPage,
    session::VmiSession,
};

/// Key of one v2p cache entry: the paging root and the page-aligned
/// virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct V2pKey {
    root: Pa,
    va: Va,
}

/// Value of one v2p cache entry: the page base and the effective page size
/// (large pages occupy one entry per 4K-aligned key that hits them).
#[derive(Debug, Clone, Copy)]
struct V2pEntry {
    base: Pa,
    size: u64,
}

struct Cache {
    page: RefCell<LruCache<Gfn, VmiMappedPage>>,
    v2p: RefCell<LruCache<V2pKey, V2pEntry>>,
}

impl Cache {
    /// Default capacity of the live-mode page cache, in pages.
    const DEFAULT_PAGE_CACHE_SIZE: usize = 512;

    /// Default capacity of the v2p translation cache.
    const DEFAULT_V2P_CACHE_SIZE: usize = 8192;

    fn new() -> Self {
        Self {
            page: RefCell::new(LruCache::new(
                NonZeroUsize::new(Self::DEFAULT_PAGE_CACHE_SIZE).unwrap(),
            )),
            v2p: RefCell::new(LruCache::new(
                NonZeroUsize::new(Self::DEFAULT_V2P_CACHE_SIZE).unwrap(),
            )),
        }
    }
}

/// The core introspection instance.
///
/// Owns the driver, the memory page cache, the v2p translation cache, and
/// the paging state discovered during initialization (`page_mode`, `kpgd`,
/// `init_task`).
///
/// The instance is single-threaded by contract: it must not be touched
/// concurrently from two threads, and there are no internal worker threads.
/// All operations are synchronous; the only blocking points are driver
/// round trips and the events [`listen`] call.
///
/// [`listen`]: Self::listen
pub struct VmiCore<Driver>
where
    Driver: VmiDriver,
{
    driver: Driver,
    cache: Cache,

    page_mode: Cell<Option<PageMode>>,
    kpgd: Cell<Pa>,
    init_task: Cell<Va>,

    read_page_fn: fn(&Self, Gfn) -> Result<VmiMappedPage, VmiError>,
    translate_paging_fn: fn(&Self, Va, Pa) -> Result<Pa, VmiError>,
}

impl<Driver> VmiCore<Driver>
where
    Driver: VmiDriver,
{
    /// Creates a new instance with the given driver.
    ///
    /// The page cache and the v2p cache are enabled by default.
    pub fn new(driver: Driver) -> Result<Self, VmiError> {
        Ok(Self {
            driver,
            cache: Cache::new(),
            page_mode: Cell::new(None),
            kpgd: Cell::new(Pa(0)),
            init_task: Cell::new(Va(0)),
            read_page_fn: Self::read_page_cache,
            translate_paging_fn: Self::translate_paging_cache,
        })
    }

    /// Returns the driver used by this instance.
    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Retrieves information about the virtual machine.
    pub fn info(&self) -> Result<VmiInfo, VmiError> {
        self.driver.info()
    }

    //
    // Paging state
    //

    /// Returns the discovered paging mode, if any.
    pub fn page_mode(&self) -> Option<PageMode> {
        self.page_mode.get()
    }

    /// Sets the paging mode. Called by the OS view during initialization.
    pub fn set_page_mode(&self, mode: PageMode) {
        self.page_mode.set(Some(mode));
    }

    /// Returns the kernel directory table base.
    ///
    /// Nonzero after a completed initialization.
    pub fn kpgd(&self) -> Pa {
        self.kpgd.get()
    }

    /// Sets the kernel directory table base.
    pub fn set_kpgd(&self, kpgd: Pa) {
        self.kpgd.set(kpgd);
    }

    /// Returns the address of the first entry of the kernel process list.
    pub fn init_task(&self) -> Va {
        self.init_task.get()
    }

    /// Sets the address of the first entry of the kernel process list.
    pub fn set_init_task(&self, init_task: Va) {
        self.init_task.set(init_task);
    }

    /// Clears the discovered paging state.
    ///
    /// Used by OS views to guarantee that a failed initialization exposes
    /// no partial state.
    pub fn clear_paging_state(&self) {
        self.page_mode.set(None);
        self.kpgd.set(Pa(0));
        self.init_task.set(Va(0));
    }

    //
    // Page cache
    //

    /// Enables the page cache.
    pub fn enable_page_cache(&mut self) {
        self.read_page_fn = Self::read_page_cache;
    }

    /// Disables the page cache.
    ///
    /// Subsequent reads go to the driver on every page access.
    pub fn disable_page_cache(&mut self) {
        self.read_page_fn = Self::read_page_nocache;
    }

    /// Resizes the page cache.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn resize_page_cache(&mut self, size: usize) {
        self.cache
            .page
            .borrow_mut()
            .resize(NonZeroUsize::new(size).unwrap());
    }

    /// Removes a specific entry from the page cache.
    pub fn flush_page_cache_entry(&self, gfn: Gfn) -> Option<VmiMappedPage> {
        self.cache.page.borrow_mut().pop(&gfn)
    }

    /// Clears the entire page cache.
    pub fn flush_page_cache(&self) {
        self.cache.page.borrow_mut().clear();
    }

    //
    // V2P cache
    //

    /// Enables the v2p translation cache.
    pub fn enable_v2p_cache(&mut self) {
        self.translate_paging_fn = Self::translate_paging_cache;
    }

    /// Disables the v2p translation cache.
    ///
    /// The cache is a pure memo: disabling it changes performance, never
    /// results.
    pub fn disable_v2p_cache(&mut self) {
        self.translate_paging_fn = Self::translate_paging_nocache;
    }

    /// Clears the v2p cache.
    ///
    /// Call this whenever the guest may have modified its pagetables, e.g.
    /// at the start of every event-handling iteration.
    pub fn flush_v2p_cache(&self) {
        self.cache.v2p.borrow_mut().clear();
    }

    /// Flushes every cache owned by the core.
    pub fn flush_caches(&self) {
        self.flush_page_cache();
        self.flush_v2p_cache();
    }

    //
    // VM lifecycle
    //

    /// Pauses the virtual machine. Best effort.
    pub fn pause(&self) -> Result<(), VmiError> {
        self.driver.pause()
    }

    /// Resumes the virtual machine.
    pub fn resume(&self) -> Result<(), VmiError> {
        self.driver.resume()
    }

    /// Pauses the virtual machine and returns a guard that resumes it when
    /// dropped.
    pub fn pause_guard(&self) -> Result<VmiPauseGuard<'_, Driver>, VmiError> {
        VmiPauseGuard::new(&self.driver)
    }

    /// Retrieves the registers of a virtual CPU.
    pub fn registers(
        &self,
        vcpu: VcpuId,
    ) -> Result<<Driver::Architecture as Architecture>::Registers, VmiError> {
        self.driver.registers(vcpu)
    }

    /// Sets the registers of a virtual CPU.
    ///
    /// Writes while the VM is unpaused have undefined effect.
    pub fn set_registers(
        &self,
        vcpu: VcpuId,
        registers: <Driver::Architecture as Architecture>::Registers,
    ) -> Result<(), VmiError> {
        self.driver.set_registers(vcpu, registers)
    }

    /// Returns the pointer width of a virtual CPU in bytes.
    pub fn address_width(&self, vcpu: VcpuId) -> Result<usize, VmiError> {
        let width = self.registers(vcpu)?.address_width();
        if width == 0 {
            return Err(VmiError::NotInitialized);
        }

        Ok(width)
    }

    //
    // Snapshot
    //

    /// Converts the live VM into a stable, zero-copy snapshot view.
    ///
    /// Every cache is flushed: cached pages refer to live-mode buffers, and
    /// cached translations may predate the freeze.
    pub fn snapshot_create(&self) -> Result<(), VmiError> {
        self.flush_caches();
        self.driver.snapshot_create()
    }

    /// Tears down the snapshot and restores live access.
    ///
    /// Required even on error paths, so the shared-memory object backing
    /// the snapshot is unlinked.
    pub fn snapshot_destroy(&self) -> Result<(), VmiError> {
        let result = self.driver.snapshot_destroy();
        self.flush_caches();
        result
    }

    /// Checks whether a snapshot view is active.
    pub fn snapshot_active(&self) -> bool {
        self.driver.snapshot_active()
    }

    /// Direct guest physical memory access (dgpma).
    ///
    /// Returns a zero-copy handle and its usable length. Snapshot mode
    /// only.
    pub fn dgpma(&self, pa: Pa, count: usize) -> Result<(VmiMappedPage, usize), VmiError> {
        self.driver.direct_physical(pa, count)
    }

    //
    // Events
    //

    /// Enables monitoring of specific events.
    pub fn monitor_enable(
        &self,
        option: <Driver::Architecture as Architecture>::EventMonitor,
    ) -> Result<(), VmiError> {
        self.driver.monitor_enable(option)
    }

    /// Disables monitoring of specific events.
    pub fn monitor_disable(
        &self,
        option: <Driver::Architecture as Architecture>::EventMonitor,
    ) -> Result<(), VmiError> {
        self.driver.monitor_disable(option)
    }

    /// Returns the number of pending events.
    pub fn events_pending(&self) -> usize {
        self.driver.events_pending()
    }

    /// Waits for events and dispatches them to the handler.
    ///
    /// Blocks up to `timeout`; pending events are drained in queue order
    /// and each is handed to the handler synchronously before the call
    /// returns. No cross-VCPU ordering is promised. Cancellation is
    /// cooperative: stop calling `listen`.
    pub fn listen(
        &self,
        timeout: Duration,
        handler: impl FnMut(&VmiEvent<Driver::Architecture>) -> VmiEventResponse<Driver::Architecture>,
    ) -> Result<(), VmiError> {
        self.driver.listen(timeout, handler)
    }

    /// Clears all event monitors and stateful monitoring data.
    pub fn reset_state(&self) -> Result<(), VmiError> {
        self.driver.reset_state()
    }

    //
    // Memory access
    //

    /// Reads memory from the virtual machine.
    ///
    /// A read of zero bytes succeeds without touching the driver. Reads
    /// straddling page boundaries are split; the resulting buffer is
    /// contiguous.
    pub fn read(&self, ctx: impl Into<AccessContext>, buffer: &mut [u8]) -> Result<(), VmiError> {
        let ctx = ctx.into();
        let mut position = 0usize;
        let mut remaining = buffer.len();

        while remaining > 0 {
            let address = self.translate_access_context(ctx + position as u64)?;
            let gfn = Driver::Architecture::gfn_from_pa(address);
            let offset = Driver::Architecture::pa_offset(address) as usize;

            let page = self.read_page(gfn)?;
            if offset >= page.len() {
                return Err(VmiError::OutOfBounds);
            }
            let page = &page[offset..];

            let size = std::cmp::min(remaining, page.len());
            buffer[position..position + size].copy_from_slice(&page[..size]);

            position += size;
            remaining -= size;
        }

        Ok(())
    }

    /// Writes memory to the virtual machine.
    ///
    /// Writes bypass the page cache and go directly to the driver; cached
    /// copies of the touched frames are dropped. Fails in snapshot mode.
    pub fn write(&self, ctx: impl Into<AccessContext>, buffer: &[u8]) -> Result<(), VmiError> {
        let ctx = ctx.into();
        let mut position = 0usize;
        let mut remaining = buffer.len();

        while remaining > 0 {
            let address = self.translate_access_context(ctx + position as u64)?;
            let offset = Driver::Architecture::pa_offset(address);

            let size = std::cmp::min(
                remaining,
                (Driver::Architecture::PAGE_SIZE - offset) as usize,
            );

            self.driver.write(address, &buffer[position..position + size])?;
            self.flush_page_cache_entry(Driver::Architecture::gfn_from_pa(address));

            position += size;
            remaining -= size;
        }

        Ok(())
    }

    /// Reads a single byte from the virtual machine.
    pub fn read_u8(&self, ctx: impl Into<AccessContext>) -> Result<u8, VmiError> {
        let mut buffer = [0u8; 1];
        self.read(ctx, &mut buffer)?;
        Ok(buffer[0])
    }

    /// Reads a 16-bit unsigned integer from the virtual machine.
    pub fn read_u16(&self, ctx: impl Into<AccessContext>) -> Result<u16, VmiError> {
        let mut buffer = [0u8; 2];
        self.read(ctx, &mut buffer)?;
        Ok(u16::from_le_bytes(buffer))
    }

    /// Reads a 32-bit unsigned integer from the virtual machine.
    pub fn read_u32(&self, ctx: impl Into<AccessContext>) -> Result<u32, VmiError> {
        let mut buffer = [0u8; 4];
        self.read(ctx, &mut buffer)?;
        Ok(u32::from_le_bytes(buffer))
    }

    /// Reads a 64-bit unsigned integer from the virtual machine.
    pub fn read_u64(&self, ctx: impl Into<AccessContext>) -> Result<u64, VmiError> {
        let mut buffer = [0u8; 8];
        self.read(ctx, &mut buffer)?;
        Ok(u64::from_le_bytes(buffer))
    }

    /// Reads an unsigned integer of the given size (1, 2, 4 or 8 bytes).
    pub fn read_uint(&self, ctx: impl Into<AccessContext>, size: usize) -> Result<u64, VmiError> {
        match size {
            1 => self.read_u8(ctx).map(u64::from),
            2 => self.read_u16(ctx).map(u64::from),
            4 => self.read_u32(ctx).map(u64::from),
            8 => self.read_u64(ctx),
            _ => Err(VmiError::InvalidAddressWidth),
        }
    }

    /// Reads an address-sized unsigned integer.
    pub fn read_address(
        &self,
        ctx: impl Into<AccessContext>,
        address_width: usize,
    ) -> Result<u64, VmiError> {
        match address_width {
            4 => Ok(self.read_u32(ctx)? as u64),
            8 => self.read_u64(ctx),
            _ => Err(VmiError::InvalidAddressWidth),
        }
    }

    /// Reads a virtual address of the given width.
    pub fn read_va(
        &self,
        ctx: impl Into<AccessContext>,
        address_width: usize,
    ) -> Result<Va, VmiError> {
        Ok(Va(self.read_address(ctx, address_width)?))
    }

    /// Reads a null-terminated string of bytes, up to `limit` bytes.
    pub fn read_string_limited(
        &self,
        ctx: impl Into<AccessContext>,
        limit: usize,
    ) -> Result<String, VmiError> {
        let mut ctx = ctx.into();
        let mut buffer = Vec::new();

        'outer: while buffer.len() < limit {
            // Read to the end of the current page, then continue page by
            // page until the terminator shows up.
            let chunk_size = (Driver::Architecture::PAGE_SIZE
                - (ctx.address & !Driver::Architecture::PAGE_MASK))
                as usize;
            let mut chunk = vec![0u8; chunk_size.min(limit - buffer.len())];
            self.read(ctx, &mut chunk)?;

            match chunk.iter().position(|&b| b == 0) {
                Some(position) => {
                    buffer.extend_from_slice(&chunk[..position]);
                    break 'outer;
                }
                None => {
                    ctx.address += chunk.len() as u64;
                    buffer.extend_from_slice(&chunk);
                }
            }
        }

        Ok(String::from_utf8_lossy(&buffer).into())
    }

    /// Reads a null-terminated string of bytes.
    pub fn read_string(&self, ctx: impl Into<AccessContext>) -> Result<String, VmiError> {
        self.read_string_limited(ctx, 4096)
    }

    /// Reads a struct from the virtual machine.
    pub fn read_struct<T>(&self, ctx: impl Into<AccessContext>) -> Result<T, VmiError>
    where
        T: FromBytes + IntoBytes,
    {
        let mut result = T::new_zeroed();
        self.read(ctx, result.as_mut_bytes())?;
        Ok(result)
    }

    /// Writes a single byte to the virtual machine.
    pub fn write_u8(&self, ctx: impl Into<AccessContext>, value: u8) -> Result<(), VmiError> {
        self.write(ctx, &value.to_le_bytes())
    }

    /// Writes a 32-bit unsigned integer to the virtual machine.
    pub fn write_u32(&self, ctx: impl Into<AccessContext>, value: u32) -> Result<(), VmiError> {
        self.write(ctx, &value.to_le_bytes())
    }

    /// Writes a 64-bit unsigned integer to the virtual machine.
    pub fn write_u64(&self, ctx: impl Into<AccessContext>, value: u64) -> Result<(), VmiError> {
        self.write(ctx, &value.to_le_bytes())
    }

    //
    // Translation
    //

    /// Translates a virtual address through the given paging root.
    pub fn translate(&self, ctx: impl Into<AddressContext>) -> Result<Pa, VmiError> {
        let ctx = ctx.into();
        (self.translate_paging_fn)(self, ctx.va, ctx.root)
    }

    /// Translates a kernel virtual address through the kernel directory
    /// table base.
    pub fn translate_kv2p(&self, va: Va) -> Result<Pa, VmiError> {
        let kpgd = self.kpgd.get();
        if kpgd.is_null() {
            return Err(VmiError::NotInitialized);
        }

        self.translate((va, kpgd))
    }

    /// Translates an access context to a physical address.
    pub fn translate_access_context(&self, ctx: AccessContext) -> Result<Pa, VmiError> {
        match ctx.mechanism {
            TranslationMechanism::Direct => Ok(Pa(ctx.address)),
            TranslationMechanism::Paging { root: Some(root) } => {
                (self.translate_paging_fn)(self, Va(ctx.address), root)
            }
            TranslationMechanism::Paging { root: None } => self.translate_kv2p(Va(ctx.address)),
        }
    }

    /// Performs a pagetable walk, recording every consulted entry.
    pub fn page_info(&self, va: Va, root: Pa) -> Result<PageInfo, VmiError> {
        let mode = self.page_mode.get().ok_or(VmiError::NotInitialized)?;
        Driver::Architecture::translation(self, va, root, mode)
    }

    /// Collects every mapped page under the given root, sorted by virtual
    /// address.
    pub fn va_pages(&self, root: Pa) -> Result<Vec<VaPage>, VmiError> {
        let mode = self.page_mode.get().ok_or(VmiError::NotInitialized)?;
        Driver::Architecture::va_pages(self, root, mode)
    }

    /// Translates under an explicit paging mode, bypassing both the
    /// discovered mode and the v2p cache. Used by the OS views while
    /// probing candidate modes.
    pub fn translate_with_mode(&self, va: Va, root: Pa, mode: PageMode) -> Result<Pa, VmiError> {
        Driver::Architecture::translate(self, va, root, mode)
    }

    /// Reads a page of memory from the virtual machine.
    pub fn read_page(&self, gfn: Gfn) -> Result<VmiMappedPage, VmiError> {
        if self.driver.snapshot_active() {
            // Snapshot reads are pointer arithmetic into one large mapping;
            // caching them would only duplicate the handle.
            let (page, _) = self.driver.direct_physical(
                Driver::Architecture::pa_from_gfn(gfn),
                Driver::Architecture::PAGE_SIZE as usize,
            )?;
            return Ok(page);
        }

        (self.read_page_fn)(self, gfn)
    }

    fn read_page_nocache(&self, gfn: Gfn) -> Result<VmiMappedPage, VmiError> {
        self.driver.read_page(gfn)
    }

    fn read_page_cache(&self, gfn: Gfn) -> Result<VmiMappedPage, VmiError> {
        let mut cache = self.cache.page.borrow_mut();
        let value = cache.try_get_or_insert(gfn, || self.driver.read_page(gfn))?;

        // Mapped pages are reference counted, so cloning is cheap.
        Ok(value.clone())
    }

    fn translate_paging_nocache(&self, va: Va, root: Pa) -> Result<Pa, VmiError> {
        let mode = self.page_mode.get().ok_or(VmiError::NotInitialized)?;
        Driver::Architecture::translate(self, va, root, mode)
    }

    fn translate_paging_cache(&self, va: Va, root: Pa) -> Result<Pa, VmiError> {
        let key = V2pKey {
            root,
            va: Driver::Architecture::va_align_down(va),
        };

        if let Some(entry) = self.cache.v2p.borrow_mut().get(&key) {
            return Ok(entry.base + (va.0 & (entry.size - 1)));
        }

        let mode = self.page_mode.get().ok_or(VmiError::NotInitialized)?;
        let info = Driver::Architecture::translation(self, va, root, mode)?;

        match info.pa {
            Some(pa) => {
                // An entry is inserted only when its source walk succeeded.
                self.cache.v2p.borrow_mut().put(
                    key,
                    V2pEntry {
                        base: Pa(pa.0 & !(info.size - 1)),
                        size: info.size,
                    },
                );
                Ok(pa)
            }
            None => Err(VmiError::page_fault((va, root))),
        }
    }
}

/// A guard that pauses the virtual machine on creation and resumes it on
/// drop.
pub struct VmiPauseGuard<'a, Driver>
where
    Driver: VmiDriver,
{
    driver: &'a Driver,
}

impl<'a, Driver> VmiPauseGuard<'a, Driver>
where
    Driver: VmiDriver,
{
    /// Creates a new pause guard.
    pub fn new(driver: &'a Driver) -> Result<Self, VmiError> {
        driver.pause()?;
        Ok(Self { driver })
    }
}

impl<Driver> Drop for VmiPauseGuard<'_, Driver>
where
    Driver: VmiDriver,
{
    fn drop(&mut self) {
        if let Err(err) = self.driver.resume() {
            tracing::error!(?err, "Failed to resume the virtual machine");
        }
    }
}
