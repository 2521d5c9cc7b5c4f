use std::{ops::Deref, rc::Rc};

/// A region of guest memory that has been mapped or copied out of the
/// virtual machine.
///
/// The handle is reference counted; the backing buffer (a driver-owned map
/// or a heap copy) is released when the last clone is dropped. This pairs
/// every page obtained from a driver with exactly one release.
#[derive(Clone)]
pub struct VmiMappedPage(Rc<Box<dyn Deref<Target = [u8]>>>);

impl VmiMappedPage {
    /// Creates a new mapped page from any byte-dereferencable owner.
    pub fn new<T>(inner: T) -> Self
    where
        T: Deref<Target = [u8]> + 'static,
    {
        Self(Rc::new(Box::new(inner)))
    }
}

impl Deref for VmiMappedPage {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<[u8]> for VmiMappedPage {
    fn as_ref(&self) -> &[u8] {
        self.deref()
    }
}

impl std::fmt::Debug for VmiMappedPage {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("VmiMappedPage")
            .field("len", &self.0.len())
            .finish()
    }
}
