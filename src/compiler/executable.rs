//! Executable memory pool: page-granular bump allocation under W^X.
//!
//! One anonymous mapping is reserved up front, initially `PROT_NONE`.
//! Allocation hands out a [`WritableRegion`] whose pages are `READ|WRITE`;
//! sealing it flips those pages to `READ|EXEC` and yields a [`CodeBlock`].
//! A page is never writable and executable at the same time, and nothing
//! can obtain a function pointer to a region that has not been sealed.
//!
//! Blocks are never freed individually. `reset()` rewinds the whole pool.

use std::io;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::types::{JitError, JitResult};

/// Signature of a generated GEMM kernel (System V x86-64).
///
/// ```text
/// fn(a: *const f32, b: *const f32, c: *mut f32,
///    m: u32, n: u32, k: u32, alpha: f32, beta: f32)
/// ```
pub type GemmKernelFn = unsafe extern "C" fn(
    *const f32, // a
    *const f32, // b
    *mut f32,   // c
    u32,        // m
    u32,        // n
    u32,        // k
    f32,        // alpha
    f32,        // beta
);

/// Signature of a generated elementwise kernel: `fn(input, output, count)`.
pub type ActivationKernelFn = unsafe extern "C" fn(*const f32, *mut f32, u32);

/// Page protection states the pool moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prot {
    None,
    ReadWrite,
    ReadExec,
}

/// Fixed-size executable memory pool.
pub struct ExecutablePool {
    base: *mut u8,
    capacity: usize,
    used: usize,
    page: usize,
}

// SAFETY: the pool owns its mapping exclusively; all mutation goes through
// `&mut self`, so moving it to another thread is sound.
unsafe impl Send for ExecutablePool {}

impl ExecutablePool {
    /// Reserve `bytes` (rounded up to whole pages) of address space.
    pub fn new(bytes: usize) -> JitResult<Self> {
        let page = page_size();
        let capacity = round_up(bytes, page);
        if capacity == 0 {
            return Ok(Self::empty());
        }
        let base = match sys::map(capacity) {
            Ok(base) => base,
            Err(err) if err.kind() == io::ErrorKind::Unsupported => {
                log::warn!("executable memory unavailable on this platform: {err}");
                return Ok(Self::empty());
            }
            Err(err) => return Err(JitError::Mmap(err)),
        };
        log::debug!("executable pool: {} KB at {:p}", capacity / 1024, base);
        Ok(Self { base, capacity, used: 0, page })
    }

    /// A pool with no backing pages; every allocation fails.
    pub fn empty() -> Self {
        Self { base: std::ptr::null_mut(), capacity: 0, used: 0, page: page_size() }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.used
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page
    }

    /// True if `[ptr, ptr + len)` lies inside the pool's mapping.
    pub fn contains(&self, ptr: *const u8, len: usize) -> bool {
        let start = self.base as usize;
        let p = ptr as usize;
        !self.base.is_null() && p >= start && p.saturating_add(len) <= start + self.capacity
    }

    /// Bump-allocate `size` bytes (rounded up to whole pages) as writable.
    pub(crate) fn allocate(&mut self, size: usize) -> JitResult<WritableRegion<'_>> {
        let bytes = round_up(size.max(1), self.page);
        if bytes > self.remaining() {
            return Err(JitError::OutOfExecutableMemory { requested: bytes, remaining: self.remaining() });
        }
        // SAFETY: `used + bytes <= capacity`, so the range is inside the mapping.
        let ptr = unsafe { self.base.add(self.used) };
        sys::protect(ptr, bytes, Prot::ReadWrite)?;
        self.used += bytes;
        Ok(WritableRegion { ptr, capacity: bytes, len: 0, sealed: false, _pool: PhantomData })
    }

    /// Rewind the bump pointer and make every used page inaccessible.
    ///
    /// # Safety
    /// Invalidates every [`CodeBlock`] sealed from this pool. The caller must
    /// guarantee none of them is read or called afterwards.
    pub(crate) unsafe fn reset(&mut self) {
        if self.used > 0 {
            if let Err(err) = sys::protect(self.base, self.used, Prot::None) {
                log::warn!("executable pool reset: mprotect failed: {err}");
            }
        }
        self.used = 0;
    }
}

impl Drop for ExecutablePool {
    fn drop(&mut self) {
        if !self.base.is_null() {
            sys::unmap(self.base, self.capacity);
        }
    }
}

impl std::fmt::Debug for ExecutablePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutablePool")
            .field("base", &self.base)
            .field("capacity", &self.capacity)
            .field("used", &self.used)
            .finish()
    }
}

/// Freshly allocated, writable, non-executable pages.
pub(crate) struct WritableRegion<'a> {
    ptr: *mut u8,
    capacity: usize,
    len: usize,
    sealed: bool,
    _pool: PhantomData<&'a mut ExecutablePool>,
}

impl WritableRegion<'_> {
    /// Append `code` to the region.
    pub(crate) fn write(&mut self, code: &[u8]) -> JitResult<()> {
        if code.len() > self.capacity - self.len {
            return Err(JitError::overflow(format!(
                "{} bytes do not fit a {}-byte region",
                self.len + code.len(),
                self.capacity
            )));
        }
        // SAFETY: the destination range is inside this region's RW pages and
        // cannot overlap `code`, which lives outside the pool.
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.ptr.add(self.len), code.len());
        }
        self.len += code.len();
        Ok(())
    }

    /// Drop write access and grant execute: the only way to obtain a
    /// callable [`CodeBlock`].
    pub(crate) fn seal(mut self) -> JitResult<CodeBlock> {
        sys::protect(self.ptr, self.capacity, Prot::ReadExec)?;
        self.sealed = true;
        let ptr = NonNull::new(self.ptr)
            .ok_or_else(|| JitError::overflow("sealed region has a null base"))?;
        Ok(CodeBlock { ptr, size: self.len, capacity: self.capacity, exec_count: 0, total_cycles: 0 })
    }
}

impl Drop for WritableRegion<'_> {
    fn drop(&mut self) {
        // Abandoned without sealing: lock the pages again. They stay counted
        // as used until the next reset.
        if !self.sealed {
            if let Err(err) = sys::protect(self.ptr, self.capacity, Prot::None) {
                log::warn!("failed to relock abandoned code region: {err}");
            }
        }
    }
}

/// Sealed, executable machine code owned by the pool.
pub struct CodeBlock {
    ptr: NonNull<u8>,
    size: usize,
    capacity: usize,
    exec_count: u64,
    total_cycles: u64,
}

// SAFETY: the block's pages are read-only once sealed; the pointer is only
// dereferenced for reads and calls.
unsafe impl Send for CodeBlock {}

impl CodeBlock {
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Bytes of code (plus constant pool) written.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes reserved for this block (whole pages).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn exec_count(&self) -> u64 {
        self.exec_count
    }

    #[inline]
    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    pub fn avg_cycles(&self) -> f64 {
        if self.exec_count == 0 {
            0.0
        } else {
            self.total_cycles as f64 / self.exec_count as f64
        }
    }

    /// The generated bytes.
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the pages are mapped READ|EXEC for as long as the owning
        // pool lives unreset, which the cache that hands out blocks upholds.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    pub(crate) fn record_exec(&mut self, cycles: u64) {
        self.exec_count += 1;
        self.total_cycles = self.total_cycles.saturating_add(cycles);
    }

    /// Reinterpret the entry point as a GEMM kernel.
    ///
    /// # Safety
    /// The block must have been generated for a GEMM signature.
    #[inline]
    pub unsafe fn as_gemm(&self) -> GemmKernelFn {
        std::mem::transmute::<*const u8, GemmKernelFn>(self.as_ptr())
    }

    /// Reinterpret the entry point as an elementwise kernel.
    ///
    /// # Safety
    /// The block must have been generated for an activation signature.
    #[inline]
    pub unsafe fn as_activation(&self) -> ActivationKernelFn {
        std::mem::transmute::<*const u8, ActivationKernelFn>(self.as_ptr())
    }
}

impl std::fmt::Debug for CodeBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeBlock")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .field("capacity", &self.capacity)
            .field("exec_count", &self.exec_count)
            .finish()
    }
}

#[inline]
fn round_up(n: usize, page: usize) -> usize {
    n.div_ceil(page) * page
}

pub(crate) fn page_size() -> usize {
    sys::page_size()
}

#[cfg(unix)]
mod sys {
    use super::Prot;
    use std::io;

    pub fn page_size() -> usize {
        // SAFETY: sysconf has no preconditions.
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page > 0 {
            page as usize
        } else {
            4096
        }
    }

    pub fn map(len: usize) -> io::Result<*mut u8> {
        // SAFETY: anonymous private mapping, no fd; result checked below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(ptr as *mut u8)
    }

    pub fn protect(ptr: *mut u8, len: usize, prot: Prot) -> io::Result<()> {
        let flags = match prot {
            Prot::None => libc::PROT_NONE,
            Prot::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Prot::ReadExec => libc::PROT_READ | libc::PROT_EXEC,
        };
        // SAFETY: callers only pass page-aligned ranges inside the pool mapping.
        let ret = unsafe { libc::mprotect(ptr as *mut libc::c_void, len, flags) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn unmap(ptr: *mut u8, len: usize) {
        // SAFETY: `ptr`/`len` describe exactly the mapping created by `map`.
        unsafe {
            libc::munmap(ptr as *mut libc::c_void, len);
        }
    }
}

#[cfg(not(unix))]
mod sys {
    use super::Prot;
    use std::io;

    pub fn page_size() -> usize {
        4096
    }

    pub fn map(_len: usize) -> io::Result<*mut u8> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "no mmap/mprotect"))
    }

    pub fn protect(_ptr: *mut u8, _len: usize, _prot: Prot) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "no mmap/mprotect"))
    }

    pub fn unmap(_ptr: *mut u8, _len: usize) {}
}
