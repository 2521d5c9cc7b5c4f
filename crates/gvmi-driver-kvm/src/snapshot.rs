//! The shared-memory snapshot engine.
//!
//! `snapshot-create` freezes guest RAM into a POSIX shared-memory object;
//! attaching maps it once with `MAP_PRIVATE | MAP_POPULATE`, after which
//! physical reads are pointer arithmetic. Virtual reads get per-process
//! v2m tables: the sorted pagetable leaves are coalesced into chunks of
//! contiguous guest-virtual space, and each chunk's backing physical runs
//! are overlaid with `MAP_FIXED` file mappings over one reserved
//! host-virtual region, yielding a single contiguous host slice per
//! contiguous guest-virtual run.

use std::{
    cell::RefCell,
    ffi::CString,
    fs::File,
    os::fd::{AsRawFd as _, FromRawFd as _},
    rc::Rc,
};

use memmap2::{Mmap, MmapOptions};

use gvmi_core::{Pa, ProcessId, Va, VaPage, VmiMappedPage};

use crate::Error;

///////////////////////////////////////////////////////////////////////////////
// V2M builder
///////////////////////////////////////////////////////////////////////////////

/// A maximal run of virtually and physically contiguous pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct M2pChunk {
    /// First virtual address of the run.
    pub va_begin: Va,

    /// Last virtual address of the run (inclusive).
    pub va_end: Va,

    /// First backing physical address.
    pub pa_begin: Pa,

    /// Last backing physical address (inclusive).
    pub pa_end: Pa,
}

/// A maximal run of contiguous guest-virtual space, backed by one or more
/// physical runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V2mChunkSpec {
    /// First virtual address of the chunk.
    pub va_begin: Va,

    /// Last virtual address of the chunk (inclusive).
    pub va_end: Va,

    /// The physical runs backing the chunk, in virtual order.
    pub m2p: Vec<M2pChunk>,
}

impl V2mChunkSpec {
    /// Size of the chunk in bytes.
    pub fn len(&self) -> usize {
        (self.va_end.0 - self.va_begin.0 + 1) as usize
    }

    /// Checks whether the chunk is empty (it never is, by construction).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Coalesces sorted pagetable leaves into v2m chunk specifications.
///
/// Pages whose backing falls outside guest RAM are dropped: they cannot be
/// served from the snapshot object.
pub fn coalesce(pages: &[VaPage], ram_size: u64) -> Vec<V2mChunkSpec> {
    let mut chunks: Vec<V2mChunkSpec> = Vec::new();

    for page in pages {
        if page.pa.0 >= ram_size {
            continue;
        }

        let (va_begin, va_end) = (page.va, page.va_end());
        let (pa_begin, pa_end) = (page.pa, page.pa_end());

        if let Some(chunk) = chunks.last_mut()
            && va_begin.0.checked_sub(1) == Some(chunk.va_end.0)
        {
            // Virtually contiguous: the chunk grows; the physical run
            // either extends or a new one starts.
            chunk.va_end = va_end;

            let last = chunk.m2p.last_mut().unwrap();
            if pa_begin.0.checked_sub(1) == Some(last.pa_end.0) {
                last.va_end = va_end;
                last.pa_end = pa_end;
            } else {
                chunk.m2p.push(M2pChunk {
                    va_begin,
                    va_end,
                    pa_begin,
                    pa_end,
                });
            }

            continue;
        }

        chunks.push(V2mChunkSpec {
            va_begin,
            va_end,
            m2p: vec![M2pChunk {
                va_begin,
                va_end,
                pa_begin,
                pa_end,
            }],
        });
    }

    chunks
}

///////////////////////////////////////////////////////////////////////////////
// Host mappings
///////////////////////////////////////////////////////////////////////////////

/// One reserved host-virtual region mirroring a v2m chunk.
struct V2mRegion {
    base: *mut libc::c_void,
    len: usize,
}

impl V2mRegion {
    /// Reserves a region of the chunk's size, then overlays it with fixed
    /// mappings of the snapshot object at each physical run.
    fn map(fd: i32, chunk: &V2mChunkSpec) -> Result<Self, Error> {
        let len = chunk.len();

        // SAFETY: anonymous reservation of unused address space.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };

        if base == libc::MAP_FAILED {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        let region = Self { base, len };

        for m2p in &chunk.m2p {
            let offset = (m2p.va_begin.0 - chunk.va_begin.0) as usize;
            let run_len = (m2p.va_end.0 - m2p.va_begin.0 + 1) as usize;

            // SAFETY: the target range lies inside the reservation just
            // created; MAP_FIXED replaces it atomically.
            let mapped = unsafe {
                libc::mmap(
                    region.base.add(offset),
                    run_len,
                    libc::PROT_READ,
                    libc::MAP_PRIVATE
                        | libc::MAP_NORESERVE
                        | libc::MAP_POPULATE
                        | libc::MAP_FIXED,
                    fd,
                    m2p.pa_begin.0 as libc::off_t,
                )
            };

            if mapped == libc::MAP_FAILED {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
        }

        Ok(region)
    }
}

impl Drop for V2mRegion {
    fn drop(&mut self) {
        // SAFETY: one munmap of the whole reservation releases the overlay
        // mappings with it.
        unsafe {
            libc::munmap(self.base, self.len);
        }
    }
}

impl std::ops::Deref for V2mRegion {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        // SAFETY: the region stays mapped for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.base as *const u8, self.len) }
    }
}

/// A window into a v2m region, keeping the region alive.
struct V2mWindow {
    region: Rc<V2mRegion>,
    offset: usize,
    len: usize,
}

impl std::ops::Deref for V2mWindow {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.region[self.offset..self.offset + self.len]
    }
}

/// A window into the base snapshot mapping.
struct SnapshotWindow {
    map: Rc<Mmap>,
    offset: usize,
    len: usize,
}

impl std::ops::Deref for SnapshotWindow {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.map[self.offset..self.offset + self.len]
    }
}

/// One mapped v2m chunk.
struct V2mChunk {
    va_begin: Va,
    va_end: Va,
    region: Rc<V2mRegion>,
}

/// The v2m table of one process.
struct V2mTable {
    pid: ProcessId,
    chunks: Vec<V2mChunk>,
}

///////////////////////////////////////////////////////////////////////////////
// Snapshot
///////////////////////////////////////////////////////////////////////////////

/// An attached shared-memory snapshot.
pub struct Snapshot {
    shm_name: CString,
    file: File,
    map: Rc<Mmap>,
    size: u64,
    registers: String,
    v2m: RefCell<Vec<V2mTable>>,
}

impl Snapshot {
    /// Opens the shared-memory object and maps it read-only, prefetching
    /// the whole working set.
    pub fn attach(shm_name: &str, size: u64, registers: String) -> Result<Self, Error> {
        let c_name = CString::new(shm_name)
            .map_err(|_| Error::Qmp("shared-memory name contains NUL".to_string()))?;

        // SAFETY: plain shm_open; the fd is owned by the File below.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        // SAFETY: the fd was just returned by shm_open and is unowned.
        let file = unsafe { File::from_raw_fd(fd) };

        // SAFETY: the object is read-only and sized by the hypervisor.
        let map = unsafe {
            MmapOptions::new()
                .len(size as usize)
                .populate()
                .map_copy_read_only(&file)?
        };

        tracing::debug!(shm_name, size, "attached shared-memory snapshot");

        Ok(Self {
            shm_name: c_name,
            file,
            map: Rc::new(map),
            size,
            registers,
            v2m: RefCell::new(Vec::new()),
        })
    }

    /// Returns the register dump captured at snapshot time.
    pub fn registers(&self) -> &str {
        &self.registers
    }

    /// Returns the snapshot size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Direct physical access: a zero-copy slice at `pa`, clamped to the
    /// end of guest RAM.
    pub fn dgpma(&self, pa: Pa, count: usize) -> Result<(VmiMappedPage, usize), Error> {
        if pa.0 >= self.size {
            return Err(Error::OutOfBounds);
        }

        let usable = count.min((self.size - pa.0) as usize);

        Ok((
            VmiMappedPage::new(SnapshotWindow {
                map: self.map.clone(),
                offset: pa.0 as usize,
                len: usable,
            }),
            usable,
        ))
    }

    /// Looks `va` up in the pid's v2m table.
    ///
    /// Returns the mapped slice and the run length from `va` to the end of
    /// the containing chunk (or `count`, whichever is smaller); `None`
    /// when no table covers the address.
    pub fn dgvma_lookup(
        &self,
        pid: ProcessId,
        va: Va,
        count: usize,
    ) -> Option<(VmiMappedPage, usize)> {
        let v2m = self.v2m.borrow();
        let table = v2m.iter().find(|table| table.pid == pid)?;

        for chunk in &table.chunks {
            if va >= chunk.va_begin && va <= chunk.va_end {
                let offset = (va.0 - chunk.va_begin.0) as usize;
                let usable = count.min((chunk.va_end.0 - va.0 + 1) as usize);

                return Some((
                    VmiMappedPage::new(V2mWindow {
                        region: chunk.region.clone(),
                        offset,
                        len: usable,
                    }),
                    usable,
                ));
            }
        }

        None
    }

    /// Checks whether a v2m table exists for the pid.
    pub fn has_v2m_table(&self, pid: ProcessId) -> bool {
        self.v2m.borrow().iter().any(|table| table.pid == pid)
    }

    /// Builds (or rebuilds) the v2m table for a pid from its enumerated
    /// pagetable leaves.
    pub fn build_v2m(&self, pid: ProcessId, pages: &[VaPage]) -> Result<(), Error> {
        let specs = coalesce(pages, self.size);
        let fd = self.file.as_raw_fd();

        let mut chunks = Vec::with_capacity(specs.len());
        for spec in &specs {
            chunks.push(V2mChunk {
                va_begin: spec.va_begin,
                va_end: spec.va_end,
                region: Rc::new(V2mRegion::map(fd, spec)?),
            });
        }

        tracing::debug!(%pid, chunks = chunks.len(), "built v2m table");

        let mut v2m = self.v2m.borrow_mut();
        v2m.retain(|table| table.pid != pid);
        v2m.push(V2mTable { pid, chunks });

        Ok(())
    }

    /// Unmaps every v2m region, unmaps the snapshot and unlinks the
    /// shared-memory object.
    pub fn detach(self) -> Result<(), Error> {
        self.v2m.borrow_mut().clear();

        // SAFETY: unlinking by the name used at attach time.
        let result = unsafe { libc::shm_unlink(self.shm_name.as_ptr()) };

        if result != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(va: u64, pa: u64, size: u64) -> VaPage {
        VaPage {
            va: Va(va),
            pa: Pa(pa),
            size,
        }
    }

    const RAM: u64 = 0x1000_0000;

    #[test]
    fn contiguous_pages_merge_into_one_run() {
        let chunks = coalesce(
            &[
                page(0x1000, 0x5000, 0x1000),
                page(0x2000, 0x6000, 0x1000),
                page(0x3000, 0x7000, 0x1000),
            ],
            RAM,
        );

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].va_begin, Va(0x1000));
        assert_eq!(chunks[0].va_end, Va(0x3fff));
        assert_eq!(chunks[0].m2p.len(), 1);
        assert_eq!(chunks[0].m2p[0].pa_begin, Pa(0x5000));
        assert_eq!(chunks[0].m2p[0].pa_end, Pa(0x7fff));
    }

    #[test]
    fn physical_discontinuity_splits_the_run_not_the_chunk() {
        let chunks = coalesce(
            &[
                page(0x1000, 0x5000, 0x1000),
                page(0x2000, 0x9000, 0x1000),
            ],
            RAM,
        );

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].va_end, Va(0x2fff));
        assert_eq!(chunks[0].m2p.len(), 2);
        assert_eq!(chunks[0].m2p[1].va_begin, Va(0x2000));
        assert_eq!(chunks[0].m2p[1].pa_begin, Pa(0x9000));
    }

    #[test]
    fn virtual_gap_starts_a_new_chunk() {
        let chunks = coalesce(
            &[
                page(0x1000, 0x5000, 0x1000),
                page(0x8000, 0x6000, 0x1000),
            ],
            RAM,
        );

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].va_end, Va(0x1fff));
        assert_eq!(chunks[1].va_begin, Va(0x8000));
    }

    #[test]
    fn mixed_page_sizes_coalesce() {
        // A 2MiB page followed by a 4KiB page, virtually and physically
        // adjacent.
        let chunks = coalesce(
            &[
                page(0x20_0000, 0x40_0000, 0x20_0000),
                page(0x40_0000, 0x60_0000, 0x1000),
            ],
            RAM,
        );

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].m2p.len(), 1);
        assert_eq!(chunks[0].len(), 0x20_1000);
    }

    #[test]
    fn pages_past_guest_ram_are_dropped() {
        let chunks = coalesce(
            &[
                page(0x1000, 0x5000, 0x1000),
                page(0x2000, RAM + 0x1000, 0x1000),
            ],
            RAM,
        );

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].va_end, Va(0x1fff));
    }

    #[test]
    fn chunk_sizes_are_exact() {
        let chunks = coalesce(&[page(0xffff_8000_0000_0000, 0, 0x1000)], RAM);
        assert_eq!(chunks[0].len(), 0x1000);
        assert!(!chunks[0].is_empty());
    }
}
