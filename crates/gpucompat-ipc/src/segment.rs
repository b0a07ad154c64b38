//! Named shared-memory segments holding one [`EventSegmentHeader`].
//!
//! Segments are POSIX shared memory objects (`shm_open` + `mmap`). Every
//! attached mapping counts as one owner; the mapping that drops the owner
//! count to zero unlinks the name.

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use gpucompat_core::DeviceId;

use crate::layout::{EventSegmentHeader, LayoutError, IPC_HANDLE_SIZE};
use crate::ring::SignalRing;

/// How many fresh names to try before giving up on `EEXIST`.
const CREATE_ATTEMPTS: u32 = 16;

static NEXT_SEGMENT: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("invalid segment name {0:?}")]
    InvalidName(String),
    #[error("{op} failed for {name}: {source}")]
    Os {
        op: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("segment {name} is {size} bytes, expected at least {expected}")]
    TooSmall {
        name: String,
        size: usize,
        expected: usize,
    },
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error("shared memory segments are not supported on this platform")]
    Unsupported,
}

/// A mapped event segment.
pub struct SharedSegment {
    name: String,
    header: NonNull<EventSegmentHeader>,
    /// Whether this mapping holds one of the `owners` references.
    attached: AtomicBool,
}

// SAFETY: the mapping is only accessed through the atomics in
// `EventSegmentHeader`, and it stays mapped until drop.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create, map and initialize a new uniquely named segment.
    ///
    /// The returned mapping is attached as the first owner.
    pub fn create(device: DeviceId) -> Result<Self, SegmentError> {
        let process_id = std::process::id();
        let mut last_err = None;

        for _ in 0..CREATE_ATTEMPTS {
            let name = unique_name(process_id);
            match sys::create(&name) {
                Ok(header) => {
                    let segment = Self {
                        name,
                        header,
                        attached: AtomicBool::new(true),
                    };
                    segment.header().initialize(device, process_id as i32);
                    tracing::debug!(name = %segment.name, device = device.0, "created event segment");
                    return Ok(segment);
                }
                Err(SegmentError::Os { source, .. })
                    if source.kind() == io::ErrorKind::AlreadyExists =>
                {
                    last_err = Some(source);
                }
                Err(e) => return Err(e),
            }
        }

        Err(SegmentError::Os {
            op: "shm_open",
            name: "<unique>".into(),
            source: last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AlreadyExists)),
        })
    }

    /// Map an existing segment without taking an owner reference.
    pub fn open(name: &str) -> Result<Self, SegmentError> {
        validate_name(name)?;
        let header = sys::open(name)?;
        Ok(Self {
            name: name.to_owned(),
            header,
            attached: AtomicBool::new(false),
        })
    }

    /// Take an owner reference. Idempotent per mapping.
    pub fn attach(&self) {
        if !self.attached.swap(true, Ordering::AcqRel) {
            let owners = self.header().owners.fetch_add(1, Ordering::AcqRel) + 1;
            tracing::debug!(name = %self.name, owners, "attached to event segment");
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn header(&self) -> &EventSegmentHeader {
        // SAFETY: `header` points at a live mapping of at least
        // `EventSegmentHeader::SIZE` bytes for the lifetime of `self`.
        unsafe { self.header.as_ref() }
    }

    #[inline]
    pub fn ring(&self) -> SignalRing<'_> {
        SignalRing::new(self.header())
    }
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("name", &self.name)
            .field("attached", &self.attached.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if self.attached.load(Ordering::Acquire) {
            let previous = self.header().owners.fetch_sub(1, Ordering::AcqRel);
            if previous == 1 {
                tracing::debug!(name = %self.name, "last owner detached, unlinking event segment");
                if let Err(e) = sys::unlink(&self.name) {
                    tracing::warn!("failed to unlink event segment: {}", e);
                }
            }
        }
        if let Err(e) = sys::unmap(self.header) {
            tracing::warn!("failed to unmap event segment {}: {}", self.name, e);
        }
    }
}

fn unique_name(process_id: u32) -> String {
    let seq = NEXT_SEGMENT.fetch_add(1, Ordering::Relaxed);
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() ^ (d.as_secs() as u32))
        .unwrap_or(0);
    format!("/gce_{process_id:x}_{seq:x}_{nonce:08x}")
}

fn validate_name(name: &str) -> Result<(), SegmentError> {
    let valid = name.len() > 1
        && name.len() < IPC_HANDLE_SIZE
        && name.starts_with('/')
        && !name[1..].contains('/')
        && !name.contains('\0');
    if valid {
        Ok(())
    } else {
        Err(SegmentError::InvalidName(name.to_owned()))
    }
}

#[cfg(unix)]
mod sys {
    use std::ffi::CString;
    use std::io;
    use std::ptr::NonNull;

    use super::SegmentError;
    use crate::layout::EventSegmentHeader;

    fn os_error(op: &'static str, name: &str) -> SegmentError {
        SegmentError::Os {
            op,
            name: name.to_owned(),
            source: io::Error::last_os_error(),
        }
    }

    fn c_name(name: &str) -> Result<CString, SegmentError> {
        CString::new(name).map_err(|_| SegmentError::InvalidName(name.to_owned()))
    }

    pub(super) fn create(name: &str) -> Result<NonNull<EventSegmentHeader>, SegmentError> {
        let c_name = c_name(name)?;
        // shm_open is variadic on Apple targets, where mode_t would not promote.
        #[cfg(target_vendor = "apple")]
        let mode = 0o600 as libc::c_uint;
        #[cfg(not(target_vendor = "apple"))]
        let mode = 0o600 as libc::mode_t;
        // SAFETY: c_name is a valid NUL-terminated string.
        let fd = unsafe {
            libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, mode)
        };
        if fd < 0 {
            return Err(os_error("shm_open", name));
        }

        let size = EventSegmentHeader::SIZE;
        // SAFETY: fd is a freshly opened shared memory object.
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } < 0 {
            let err = os_error("ftruncate", name);
            // SAFETY: fd is open and c_name names the object we just created.
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(err);
        }

        let mapped = map(fd, size, name);
        // SAFETY: fd is open; the mapping (if any) keeps the object alive.
        unsafe { libc::close(fd) };
        if mapped.is_err() {
            // SAFETY: c_name names the object we just created.
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
        mapped
    }

    pub(super) fn open(name: &str) -> Result<NonNull<EventSegmentHeader>, SegmentError> {
        let c_name = c_name(name)?;
        // SAFETY: c_name is a valid NUL-terminated string.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(os_error("shm_open", name));
        }

        // SAFETY: zeroed is a valid bit pattern for libc::stat.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        // SAFETY: fd is open and stat is a valid out pointer.
        if unsafe { libc::fstat(fd, &mut stat) } < 0 {
            let err = os_error("fstat", name);
            // SAFETY: fd is open.
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let size = stat.st_size.max(0) as usize;
        if size < EventSegmentHeader::SIZE {
            // SAFETY: fd is open.
            unsafe { libc::close(fd) };
            return Err(SegmentError::TooSmall {
                name: name.to_owned(),
                size,
                expected: EventSegmentHeader::SIZE,
            });
        }

        let mapped = map(fd, EventSegmentHeader::SIZE, name);
        // SAFETY: fd is open.
        unsafe { libc::close(fd) };
        mapped
    }

    fn map(
        fd: libc::c_int,
        size: usize,
        name: &str,
    ) -> Result<NonNull<EventSegmentHeader>, SegmentError> {
        // SAFETY: fd refers to an object of at least `size` bytes.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(os_error("mmap", name));
        }
        NonNull::new(ptr.cast::<EventSegmentHeader>()).ok_or_else(|| os_error("mmap", name))
    }

    pub(super) fn unmap(header: NonNull<EventSegmentHeader>) -> io::Result<()> {
        // SAFETY: header was returned by `map` with this exact size.
        let ret = unsafe { libc::munmap(header.as_ptr().cast(), EventSegmentHeader::SIZE) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(super) fn unlink(name: &str) -> io::Result<()> {
        let c_name = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: c_name is a valid NUL-terminated string.
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(not(unix))]
mod sys {
    use std::io;
    use std::ptr::NonNull;

    use super::SegmentError;
    use crate::layout::EventSegmentHeader;

    pub(super) fn create(_name: &str) -> Result<NonNull<EventSegmentHeader>, SegmentError> {
        Err(SegmentError::Unsupported)
    }

    pub(super) fn open(_name: &str) -> Result<NonNull<EventSegmentHeader>, SegmentError> {
        Err(SegmentError::Unsupported)
    }

    pub(super) fn unmap(_header: NonNull<EventSegmentHeader>) -> io::Result<()> {
        Ok(())
    }

    pub(super) fn unlink(_name: &str) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use gpucompat_core::{PollPolicy, WaitableFlag};

    #[test]
    fn test_create_initializes_header() {
        let segment = SharedSegment::create(DeviceId(1)).unwrap();
        let header = segment.header();
        assert_eq!(header.validate(), Ok(()));
        assert_eq!(header.owners.load(Ordering::Relaxed), 1);
        assert_eq!(header.owner_device(), DeviceId(1));
        assert_eq!(header.owner_process(), std::process::id() as i32);
        assert!(segment.name().starts_with("/gce_"));
    }

    #[test]
    fn test_two_mappings_share_memory() {
        let created = SharedSegment::create(DeviceId(0)).unwrap();
        let opened = SharedSegment::open(created.name()).unwrap();

        let claim = created.ring().claim(PollPolicy::Spin);
        created.ring().slot(claim.offset).raise();
        created.ring().publish(claim.write_index, PollPolicy::Spin);

        assert_eq!(opened.ring().read_index(), 0);
        assert!(opened.ring().slot(0).is_raised());
        opened.ring().slot(0).clear();
        assert!(!created.ring().slot(0).is_raised());
    }

    #[test]
    fn test_last_owner_unlinks() {
        let created = SharedSegment::create(DeviceId(0)).unwrap();
        let name = created.name().to_owned();

        let importer = SharedSegment::open(&name).unwrap();
        importer.attach();
        importer.attach();
        assert_eq!(created.header().owners.load(Ordering::Relaxed), 2);

        drop(created);
        assert_eq!(importer.header().owners.load(Ordering::Relaxed), 1);
        // Still linked while the importer holds a reference.
        drop(SharedSegment::open(&name).unwrap());

        drop(importer);
        assert!(matches!(
            SharedSegment::open(&name),
            Err(SegmentError::Os { op: "shm_open", .. })
        ));
    }

    #[test]
    fn test_unattached_mapping_does_not_release() {
        let created = SharedSegment::create(DeviceId(0)).unwrap();
        drop(SharedSegment::open(created.name()).unwrap());
        assert_eq!(created.header().owners.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_open_rejects_bad_names() {
        for name in ["", "/", "no-slash", "/a/b"] {
            assert!(matches!(
                SharedSegment::open(name),
                Err(SegmentError::InvalidName(_))
            ));
        }
        let long = format!("/{}", "x".repeat(IPC_HANDLE_SIZE));
        assert!(matches!(
            SharedSegment::open(&long),
            Err(SegmentError::InvalidName(_))
        ));
    }

    #[test]
    fn test_open_missing_segment() {
        assert!(matches!(
            SharedSegment::open("/gce_does_not_exist_0"),
            Err(SegmentError::Os { op: "shm_open", .. })
        ));
    }
}
