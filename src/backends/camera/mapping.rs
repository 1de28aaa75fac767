// SPDX-License-Identifier: GPL-3.0-only

//! Scoped read-only mapping of frame buffer memory
//!
//! A [`MappedPlane`] borrows the [`Plane`] it maps, so the mapping can never
//! outlive the request holding the buffer. The memory is unmapped when the
//! guard drops, on every exit path of the completion handler.

use super::types::Plane;
use crate::errors::FrameError;
use std::marker::PhantomData;
use std::os::fd::AsRawFd;
use std::ptr::NonNull;
use tracing::warn;

const FALLBACK_PAGE_SIZE: usize = 4096;

fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        FALLBACK_PAGE_SIZE
    }
}

/// Read-only view of one plane, unmapped on drop
pub struct MappedPlane<'a> {
    base: NonNull<libc::c_void>,
    map_len: usize,
    data_offset: usize,
    len: usize,
    _plane: PhantomData<&'a Plane>,
}

impl<'a> MappedPlane<'a> {
    /// Map `plane` read-only
    ///
    /// The mapping starts at the page boundary below the plane offset. Fails
    /// for zero-length planes and planes extending past the end of their
    /// memory object.
    pub fn map(plane: &'a Plane) -> Result<Self, FrameError> {
        if plane.is_empty() {
            return Err(FrameError::MapFailed("plane has zero length".to_string()));
        }

        let fd = plane.fd().as_raw_fd();
        check_object_size(fd, plane)?;

        let page = page_size();
        let aligned_offset = plane.offset() / page * page;
        let data_offset = plane.offset() - aligned_offset;
        let map_len = data_offset + plane.len();
        let file_offset = libc::off_t::try_from(aligned_offset)
            .map_err(|_| FrameError::MapFailed(format!("offset {} too large", aligned_offset)))?;

        // SAFETY: fd is a live descriptor borrowed from `plane` for the
        // lifetime of the guard; the result is checked before use.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                file_offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(FrameError::MapFailed(
                std::io::Error::last_os_error().to_string(),
            ));
        }
        let base = NonNull::new(ptr)
            .ok_or_else(|| FrameError::MapFailed("mmap returned null".to_string()))?;

        Ok(Self {
            base,
            map_len,
            data_offset,
            len: plane.len(),
            _plane: PhantomData,
        })
    }

    /// Mapped bytes of the plane (starting at the plane offset)
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping covers data_offset + len bytes and stays valid
        // until drop; PROT_READ matches the shared borrow.
        unsafe {
            std::slice::from_raw_parts(
                (self.base.as_ptr() as *const u8).add(self.data_offset),
                self.len,
            )
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MappedPlane<'_> {
    fn drop(&mut self) {
        // SAFETY: base/map_len are exactly what mmap returned
        let ret = unsafe { libc::munmap(self.base.as_ptr(), self.map_len) };
        if ret != 0 {
            warn!(
                error = %std::io::Error::last_os_error(),
                "munmap failed"
            );
        }
    }
}

/// Reject planes reaching past the memory object (touching them raises SIGBUS)
fn check_object_size(fd: libc::c_int, plane: &Plane) -> Result<(), FrameError> {
    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    // SAFETY: fstat writes into the provided buffer only on success
    let ret = unsafe { libc::fstat(fd, stat.as_mut_ptr()) };
    if ret != 0 {
        return Err(FrameError::MapFailed(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    // SAFETY: fstat succeeded
    let stat = unsafe { stat.assume_init() };

    // Some device memory reports no size; trust the driver then
    let object_size = usize::try_from(stat.st_size).unwrap_or(0);
    if object_size > 0 && plane.offset() + plane.len() > object_size {
        return Err(FrameError::MapFailed(format!(
            "plane {}+{} exceeds memory object of {} bytes",
            plane.offset(),
            plane.len(),
            object_size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::fs::File;
    use std::os::fd::{FromRawFd, OwnedFd};
    use std::os::unix::fs::FileExt;
    use std::sync::Arc;

    fn memfd_with(bytes: &[u8]) -> Arc<OwnedFd> {
        let name = CString::new("mapping-test").unwrap();
        let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        assert!(fd >= 0);
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(bytes.len() as u64).unwrap();
        file.write_all_at(bytes, 0).unwrap();
        Arc::new(OwnedFd::from(file))
    }

    #[test]
    fn test_maps_unaligned_offset() {
        let mut bytes = vec![0u8; 8192];
        bytes[5000..5004].copy_from_slice(&[1, 2, 3, 4]);
        let plane = Plane::new(memfd_with(&bytes), 5000, 4);
        let mapped = MappedPlane::map(&plane).unwrap();
        assert_eq!(mapped.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_rejects_plane_past_end() {
        let plane = Plane::new(memfd_with(&[0u8; 16]), 8, 16);
        assert!(matches!(
            MappedPlane::map(&plane),
            Err(FrameError::MapFailed(_))
        ));
    }

    #[test]
    fn test_rejects_empty_plane() {
        let plane = Plane::new(memfd_with(&[0u8; 16]), 0, 0);
        assert!(MappedPlane::map(&plane).is_err());
    }
}
