//! VMI driver for raw physical memory images.
//!
//! The file is mapped read-only once; every page read hands out a
//! reference-counted view into the mapping, so repeated reads are
//! zero-copy. Pause and resume are no-ops: a file never changes under the
//! reader.

use std::{fs::File, path::Path, rc::Rc};

use memmap2::Mmap;

use gvmi_core::{Architecture, Gfn, Pa, VmiDriver, VmiError, VmiInfo, VmiMappedPage};

/// A page-sized window into the shared file mapping.
struct MappedWindow {
    map: Rc<Mmap>,
    offset: usize,
    len: usize,
}

impl std::ops::Deref for MappedWindow {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.map[self.offset..self.offset + self.len]
    }
}

/// VMI driver backed by a file containing a raw dump of guest physical
/// memory.
pub struct VmiFileDriver<Arch>
where
    Arch: Architecture,
{
    map: Rc<Mmap>,
    size: u64,
    _marker: std::marker::PhantomData<Arch>,
}

impl<Arch> VmiFileDriver<Arch>
where
    Arch: Architecture,
{
    /// Maps a physical memory image.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, VmiError> {
        let file = File::open(&path)?;
        let size = file.metadata()?.len();

        // SAFETY: the mapping is read-only; concurrent mutation of the
        // underlying file is outside the driver's contract.
        let map = unsafe { Mmap::map(&file)? };

        tracing::debug!(path = %path.as_ref().display(), size, "mapped memory image");

        Ok(Self {
            map: Rc::new(map),
            size,
            _marker: std::marker::PhantomData,
        })
    }

    /// Returns the size of the image in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl<Arch> VmiDriver for VmiFileDriver<Arch>
where
    Arch: Architecture + 'static,
{
    type Architecture = Arch;

    fn info(&self) -> Result<VmiInfo, VmiError> {
        Ok(VmiInfo {
            page_size: Arch::PAGE_SIZE,
            page_shift: Arch::PAGE_SHIFT,
            ram_size: self.size,
            max_pa: Pa(self.size),
            vcpus: 0,
            hvm: false,
        })
    }

    fn read_page(&self, gfn: Gfn) -> Result<VmiMappedPage, VmiError> {
        let offset = u64::from(gfn) << Arch::PAGE_SHIFT;

        if offset + Arch::PAGE_SIZE > self.size {
            return Err(VmiError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of memory image",
            )));
        }

        Ok(VmiMappedPage::new(MappedWindow {
            map: self.map.clone(),
            offset: offset as usize,
            len: Arch::PAGE_SIZE as usize,
        }))
    }

    fn pause(&self) -> Result<(), VmiError> {
        Ok(())
    }

    fn resume(&self) -> Result<(), VmiError> {
        Ok(())
    }
}
