//! Linear memory management for a bound module.
//!
//! All host-driven allocation goes through [`MemoryManager`]: page-unit
//! growth, file-backed regions mapped over the Wasm address space, and
//! PROT_NONE guard regions bracketing dynamic module memory. Memory only
//! ever grows; nothing is handed back to the host while the module lives.

use std::io;

use tracing::{debug, error};
use wasmer::{AsStoreMut, AsStoreRef, Memory, MemoryAccessError, MemoryError, WASM_MAX_PAGES};

/// Bytes per Wasm page.
pub const WASM_PAGE_SIZE: usize = wasmer::WASM_PAGE_SIZE;

/// Pages per guard region.
pub const GUARD_REGION_PAGES: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum MemoryMapError {
    #[error("requested mapping of zero pages")]
    ZeroPages,

    #[error("growing by {delta} pages from {current} would exceed the maximum of {max} pages")]
    OutOfMaxSize { delta: u32, current: u32, max: u32 },

    #[error("unable to commit {delta} new pages from {current}: {source}")]
    OutOfMemory {
        delta: u32,
        current: u32,
        source: MemoryError,
    },

    #[error("growing by {delta} pages from {current} would exceed the host quota of {quota} pages")]
    OutOfQuota { delta: u32, current: u32, quota: u32 },

    #[error("file mapping for fd {fd} was not placed at its reserved range")]
    UnstableFileMap { fd: i32 },

    #[error("failed to map file descriptor {fd}: {source}")]
    FileMapFailed { fd: i32, source: io::Error },

    #[error("wasm range {ptr:#x}+{len:#x} is out of bounds")]
    OutOfBounds { ptr: u32, len: u32 },

    #[error("failed to protect guard region: {0}")]
    GuardProtect(region::Error),

    #[error("memory access failed: {0}")]
    Access(#[from] MemoryAccessError),
}

/// A PROT_NONE range of the linear memory, in Wasm address terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardRegion {
    pub base: u32,
    pub pages: u32,
}

impl GuardRegion {
    fn byte_range(&self) -> (usize, usize) {
        let start = self.base as usize;
        (start, start + self.pages as usize * WASM_PAGE_SIZE)
    }
}

pub struct MemoryManager {
    memory: Memory,
    quota_pages: u32,
    guard_regions: Vec<GuardRegion>,
}

impl MemoryManager {
    /// Wraps the module's exported memory. `quota_pages` is the host quota
    /// (zero disables it), enforced on top of the module's declared maximum.
    pub fn new(memory: Memory, quota_pages: u32) -> Self {
        Self {
            memory,
            quota_pages,
            guard_regions: Vec::new(),
        }
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn size_pages(&self, store: &impl AsStoreRef) -> u32 {
        self.memory.view(store).size().0
    }

    pub fn size_bytes(&self, store: &impl AsStoreRef) -> u64 {
        self.memory.view(store).data_size()
    }

    /// Grows the memory by `pages` pages and returns the Wasm address of the
    /// start of the new region. Successive calls hand out strictly
    /// increasing, disjoint regions.
    pub fn map_pages(
        &mut self,
        store: &mut impl AsStoreMut,
        pages: u32,
    ) -> Result<u32, MemoryMapError> {
        if pages == 0 {
            return Err(MemoryMapError::ZeroPages);
        }

        let current = self.size_pages(store);
        let max = self
            .memory
            .ty(store)
            .maximum
            .map(|pages| pages.0)
            .unwrap_or(WASM_MAX_PAGES);

        let target = current as u64 + pages as u64;
        if target > max as u64 {
            error!(
                delta = pages,
                current, max, "mmap would exceed the module's maximum"
            );
            return Err(MemoryMapError::OutOfMaxSize {
                delta: pages,
                current,
                max,
            });
        }

        if self.quota_pages > 0 && target > self.quota_pages as u64 {
            error!(
                delta = pages,
                current,
                quota = self.quota_pages,
                "memory resource quota exceeded"
            );
            return Err(MemoryMapError::OutOfQuota {
                delta: pages,
                current,
                quota: self.quota_pages,
            });
        }

        let previous = self
            .memory
            .grow(store, pages)
            .map_err(|source| MemoryMapError::OutOfMemory {
                delta: pages,
                current,
                source,
            })?;

        debug!(
            from = previous.0,
            to = previous.0 + pages,
            "mmap - grew memory"
        );

        Ok((previous.0 as u64 * WASM_PAGE_SIZE as u64) as u32)
    }

    /// Byte-count variant of [`MemoryManager::map_pages`]; rounds the request
    /// up to whole pages.
    pub fn map_bytes(
        &mut self,
        store: &mut impl AsStoreMut,
        n_bytes: u32,
    ) -> Result<u32, MemoryMapError> {
        let pages = n_bytes.div_ceil(WASM_PAGE_SIZE as u32);
        self.map_pages(store, pages)
    }

    /// Grows the memory up to `target_pages` if it is currently smaller.
    pub fn ensure_pages(
        &mut self,
        store: &mut impl AsStoreMut,
        target_pages: u32,
    ) -> Result<(), MemoryMapError> {
        let current = self.size_pages(store);
        if current < target_pages {
            self.map_pages(store, target_pages - current)?;
        }
        Ok(())
    }

    /// Maps `length` bytes of `fd` read-only and shared into the Wasm address
    /// space. The file must land exactly on the host range reserved for it;
    /// callers rely on the address staying put.
    pub fn map_file(
        &mut self,
        store: &mut impl AsStoreMut,
        fd: i32,
        length: u32,
    ) -> Result<u32, MemoryMapError> {
        let wasm_ptr = self.map_bytes(store, length)?;
        let host_ptr = self.native_ptr(store, wasm_ptr, length)?;

        unsafe {
            libc::munmap(host_ptr as *mut libc::c_void, length as usize);

            let mapped = libc::mmap(
                host_ptr as *mut libc::c_void,
                length as usize,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                0,
            );
            if mapped == libc::MAP_FAILED {
                let source = io::Error::last_os_error();
                error!(fd, %source, "failed mmapping file descriptor");
                return Err(MemoryMapError::FileMapFailed { fd, source });
            }
            if mapped != host_ptr as *mut libc::c_void {
                return Err(MemoryMapError::UnstableFileMap { fd });
            }
        }

        Ok(wasm_ptr)
    }

    /// Reserves `pages` pages and makes them inaccessible to the host, so
    /// stray reads and writes trap instead of corrupting a neighbour.
    pub fn install_guard(
        &mut self,
        store: &mut impl AsStoreMut,
        pages: u32,
    ) -> Result<u32, MemoryMapError> {
        let base = self.map_pages(store, pages)?;
        let len = pages as usize * WASM_PAGE_SIZE;
        let ptr = self.native_ptr(store, base, len as u32)?;

        unsafe {
            region::protect(ptr, len, region::Protection::NONE)
                .map_err(MemoryMapError::GuardProtect)?;
        }

        self.guard_regions.push(GuardRegion { base, pages });
        debug!(base, end = base as usize + len, "created guard region");

        Ok(base)
    }

    /// Translates a Wasm pointer into a host pointer, bounds-checked against
    /// the current memory size.
    pub fn native_ptr(
        &self,
        store: &impl AsStoreRef,
        wasm_ptr: u32,
        len: u32,
    ) -> Result<*mut u8, MemoryMapError> {
        let view = self.memory.view(store);
        if wasm_ptr as u64 + len as u64 > view.data_size() {
            return Err(MemoryMapError::OutOfBounds { ptr: wasm_ptr, len });
        }
        Ok(unsafe { view.data_ptr().add(wasm_ptr as usize) })
    }

    pub fn guard_regions(&self) -> &[GuardRegion] {
        &self.guard_regions
    }

    /// Adopts guard bookkeeping from another manager (used when cloning a
    /// compartment) without touching page protections.
    pub(crate) fn set_guard_regions(&mut self, regions: Vec<GuardRegion>) {
        self.guard_regions = regions;
    }

    /// Re-applies PROT_NONE to every recorded guard region.
    pub(crate) fn rearm_guards(&self, store: &impl AsStoreRef) -> Result<(), MemoryMapError> {
        for region in &self.guard_regions {
            let len = region.pages as usize * WASM_PAGE_SIZE;
            let ptr = self.native_ptr(store, region.base, len as u32)?;
            unsafe {
                region::protect(ptr, len, region::Protection::NONE)
                    .map_err(MemoryMapError::GuardProtect)?;
            }
        }
        Ok(())
    }

    /// Copies the whole memory out, with guard regions left zeroed (they
    /// cannot be read without faulting).
    pub(crate) fn read_nonguard(&self, store: &impl AsStoreRef) -> Result<Vec<u8>, MemoryMapError> {
        let view = self.memory.view(store);
        let size = view.data_size() as usize;
        let mut buf = vec![0u8; size];
        for (start, end) in self.accessible_ranges(size) {
            view.read(start as u64, &mut buf[start..end])?;
        }
        Ok(buf)
    }

    /// Writes `data` into memory from address zero, skipping guard regions.
    pub(crate) fn write_nonguard(
        &self,
        store: &impl AsStoreRef,
        data: &[u8],
    ) -> Result<(), MemoryMapError> {
        let view = self.memory.view(store);
        let limit = (view.data_size() as usize).min(data.len());
        for (start, end) in self.accessible_ranges(limit) {
            view.write(start as u64, &data[start..end])?;
        }
        Ok(())
    }

    /// The gaps between guard regions, clipped to `size` bytes. Guard
    /// regions are recorded in ascending address order.
    fn accessible_ranges(&self, size: usize) -> Vec<(usize, usize)> {
        let mut ranges = Vec::with_capacity(self.guard_regions.len() + 1);
        let mut cursor = 0usize;
        for region in &self.guard_regions {
            let (guard_start, guard_end) = region.byte_range();
            if guard_start > size {
                break;
            }
            if cursor < guard_start {
                ranges.push((cursor, guard_start.min(size)));
            }
            cursor = guard_end;
        }
        if cursor < size {
            ranges.push((cursor, size));
        }
        ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmer::{Memory, MemoryType, Store};

    fn manager(min: u32, max: u32, quota: u32) -> (Store, MemoryManager) {
        let mut store = Store::default();
        let memory = Memory::new(&mut store, MemoryType::new(min, Some(max), false)).unwrap();
        (store, MemoryManager::new(memory, quota))
    }

    #[test]
    fn map_pages_is_monotonic_and_disjoint() {
        let (mut store, mut manager) = manager(1, 200, 0);

        let mut last_end = 0u64;
        for pages in [1u32, 3, 2, 5] {
            let base = manager.map_pages(&mut store, pages).unwrap() as u64;
            assert!(base >= last_end);
            last_end = base + pages as u64 * WASM_PAGE_SIZE as u64;
        }
        assert_eq!(
            manager.size_bytes(&store),
            last_end,
            "regions must tile the grown memory exactly"
        );
    }

    #[test]
    fn zero_pages_is_rejected() {
        let (mut store, mut manager) = manager(1, 10, 0);
        assert!(matches!(
            manager.map_pages(&mut store, 0),
            Err(MemoryMapError::ZeroPages)
        ));
    }

    #[test]
    fn growing_past_declared_max_fails() {
        let (mut store, mut manager) = manager(1, 4, 0);
        assert!(matches!(
            manager.map_pages(&mut store, 10),
            Err(MemoryMapError::OutOfMaxSize { .. })
        ));
        // The failure must not have grown anything.
        assert_eq!(manager.size_pages(&store), 1);
    }

    #[test]
    fn quota_is_enforced_separately_from_max() {
        let (mut store, mut manager) = manager(1, 100, 3);
        assert!(manager.map_pages(&mut store, 2).is_ok());
        assert!(matches!(
            manager.map_pages(&mut store, 2),
            Err(MemoryMapError::OutOfQuota { .. })
        ));
    }

    #[test]
    fn map_bytes_rounds_up_to_pages() {
        let (mut store, mut manager) = manager(1, 100, 0);
        let before = manager.size_pages(&store);
        manager.map_bytes(&mut store, 1).unwrap();
        assert_eq!(manager.size_pages(&store), before + 1);
        manager
            .map_bytes(&mut store, WASM_PAGE_SIZE as u32 + 1)
            .unwrap();
        assert_eq!(manager.size_pages(&store), before + 3);
    }

    #[test]
    fn guard_regions_are_protected_and_recorded() {
        let (mut store, mut manager) = manager(1, 100, 0);

        let base = manager
            .install_guard(&mut store, GUARD_REGION_PAGES)
            .unwrap();
        assert_eq!(manager.guard_regions().len(), 1);
        assert_eq!(manager.guard_regions()[0].base, base);

        let ptr = manager.native_ptr(&store, base, 1).unwrap();
        let info = unsafe { region::query(ptr) }.unwrap();
        assert_eq!(info.protection(), region::Protection::NONE);
    }

    #[test]
    fn nonguard_copies_skip_guard_regions() {
        let (mut store, mut manager) = manager(1, 100, 0);

        let guard = manager
            .install_guard(&mut store, GUARD_REGION_PAGES)
            .unwrap();
        let data = manager.map_pages(&mut store, 1).unwrap();

        manager
            .memory()
            .view(&store)
            .write(data as u64, &[0xAB; 4])
            .unwrap();

        let bytes = manager.read_nonguard(&store).unwrap();
        assert_eq!(&bytes[data as usize..data as usize + 4], &[0xAB; 4]);
        assert!(bytes[guard as usize..guard as usize + WASM_PAGE_SIZE]
            .iter()
            .all(|b| *b == 0));

        // Writing the image back must not fault on the guard either.
        manager.write_nonguard(&store, &bytes).unwrap();
    }
}
