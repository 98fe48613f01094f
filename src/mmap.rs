use std::ptr::null_mut;

/// Anonymous memory mapping backing a heap space. Reserved up front,
/// committed lazily by the kernel; `dontneed` hands evacuated pages back.
pub struct Mmap {
    start: *mut u8,
    size: usize,
}

impl Mmap {
    pub const fn uninit() -> Self {
        Self {
            start: null_mut(),
            size: 0,
        }
    }

    pub fn new(size: usize) -> Self {
        unsafe {
            let map = libc::mmap(
                null_mut(),
                size as _,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if map == libc::MAP_FAILED {
                panic!("failed to reserve {} bytes of heap", size);
            }
            Self {
                start: map as *mut u8,
                size,
            }
        }
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    pub fn start(&self) -> *mut u8 {
        self.start
    }

    pub fn end(&self) -> *mut u8 {
        (self.start as usize + self.size) as *mut u8
    }

    pub fn contains(&self, addr: *const u8) -> bool {
        addr >= self.start as *const u8 && addr < self.end() as *const u8
    }

    /// Release the physical pages backing `[page, page + size)`. The range
    /// reads back as zero afterwards.
    pub fn dontneed(&self, page: *mut u8, size: usize) {
        unsafe {
            libc::madvise(page as *mut _, size as _, libc::MADV_DONTNEED);
        }
    }

    pub fn commit(&self, page: *mut u8, size: usize) {
        unsafe {
            libc::madvise(page as *mut _, size as _, libc::MADV_WILLNEED);
        }
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        if !self.start.is_null() {
            unsafe {
                libc::munmap(self.start as *mut _, self.size as _);
            }
        }
    }
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}
