//! Slab allocator.
//!
//! Fixed-size object caches layered on the buddy allocator. Each cache owns
//! three doubly-linked lists of slabs (empty, partial, full); a slab is one
//! or more contiguous pages holding a small header plus equally-sized object
//! slots, with a singly-linked free list threaded through the free slots.
//! The power-of-two kmalloc caches (32 B .. 4 KiB) are created at init.

use core::ptr::NonNull;

use spin::Mutex;

use super::{buddy, phys_to_virt, virt_to_phys, VirtAddr};
use crate::error::KernelError;

pub const SLAB_MAX_CACHES: usize = 32;

/// Minimum object alignment.
const SLAB_ALIGN: usize = 8;

/// Sizes of the built-in kmalloc caches.
pub const KMALLOC_SIZES: [usize; 8] = [32, 64, 128, 256, 512, 1024, 2048, 4096];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlabState {
    Empty,
    Partial,
    Full,
}

/// Free-slot link threaded through unused object slots.
#[repr(C)]
struct SlabObject {
    next: Option<NonNull<SlabObject>>,
}

/// Header at the start of every slab.
#[repr(C)]
struct Slab {
    next: Option<NonNull<Slab>>,
    prev: Option<NonNull<Slab>>,
    objects: *mut u8,
    free_list: Option<NonNull<SlabObject>>,
    num_objects: u32,
    free_objects: u32,
    state: SlabState,
}

pub struct SlabCache {
    name: &'static str,
    object_size: usize,
    aligned_size: usize,
    objects_per_slab: u32,
    slab_order: usize,
    slabs_empty: Option<NonNull<Slab>>,
    slabs_partial: Option<NonNull<Slab>>,
    slabs_full: Option<NonNull<Slab>>,
    num_allocations: u64,
    num_frees: u64,
    num_slabs: u64,
    num_active_objects: u64,
    ctor: Option<fn(*mut u8)>,
    dtor: Option<fn(*mut u8)>,
}

/// Shared handle to a cache. All operations on it go through the global
/// registry lock, which provides the exclusivity the raw pointer needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheRef(NonNull<SlabCache>);

// SAFETY: CacheRef is only dereferenced under the registry Mutex.
unsafe impl Send for CacheRef {}
unsafe impl Sync for CacheRef {}

struct CacheRegistry {
    caches: [Option<CacheRef>; SLAB_MAX_CACHES],
    count: usize,
    kmalloc: [Option<CacheRef>; KMALLOC_SIZES.len()],
}

// SAFETY: The registry's raw cache pointers are only used under its Mutex.
unsafe impl Send for CacheRegistry {}

static REGISTRY: Mutex<CacheRegistry> = Mutex::new(CacheRegistry {
    caches: [None; SLAB_MAX_CACHES],
    count: 0,
    kmalloc: [None; KMALLOC_SIZES.len()],
});

const fn align_size(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

const fn slab_header_size() -> usize {
    align_size(core::mem::size_of::<Slab>(), SLAB_ALIGN)
}

/// Smallest buddy order giving room for at least 8 objects per slab.
fn calculate_slab_order(aligned_size: usize) -> usize {
    let min_slab_size = aligned_size * 8;
    for order in 0..=3 {
        if buddy::size_for_order(order) >= min_slab_size {
            return order;
        }
    }
    2
}

impl SlabCache {
    fn list_head(&mut self, state: SlabState) -> &mut Option<NonNull<Slab>> {
        match state {
            SlabState::Empty => &mut self.slabs_empty,
            SlabState::Partial => &mut self.slabs_partial,
            SlabState::Full => &mut self.slabs_full,
        }
    }

    fn add_slab(&mut self, mut slab: NonNull<Slab>) {
        // SAFETY: slab is a live header we exclusively own under the lock.
        let state = unsafe { slab.as_ref().state };
        let head = self.list_head(state);
        // SAFETY: as above; neighbors are live slab headers.
        unsafe {
            slab.as_mut().next = *head;
            slab.as_mut().prev = None;
            if let Some(mut old) = *head {
                old.as_mut().prev = Some(slab);
            }
        }
        *head = Some(slab);
    }

    fn remove_slab(&mut self, mut slab: NonNull<Slab>) {
        // SAFETY: slab is on the list matching its state.
        unsafe {
            let state = slab.as_ref().state;
            match slab.as_ref().prev {
                Some(mut prev) => prev.as_mut().next = slab.as_ref().next,
                None => *self.list_head(state) = slab.as_ref().next,
            }
            if let Some(mut next) = slab.as_ref().next {
                next.as_mut().prev = slab.as_ref().prev;
            }
            slab.as_mut().next = None;
            slab.as_mut().prev = None;
        }
    }

    /// Allocate a fresh slab from the buddy and thread its free list.
    fn allocate_slab(&mut self) -> Option<NonNull<Slab>> {
        let phys = buddy::alloc_order(self.slab_order)?;
        let base = phys_to_virt(phys).as_mut_ptr::<u8>();

        // SAFETY: base points at a fresh, exclusively owned buddy block
        // large enough for the header plus objects_per_slab slots.
        unsafe {
            let slab_ptr = base as *mut Slab;
            let objects = base.add(slab_header_size());
            slab_ptr.write(Slab {
                next: None,
                prev: None,
                objects,
                free_list: None,
                num_objects: self.objects_per_slab,
                free_objects: self.objects_per_slab,
                state: SlabState::Empty,
            });

            let slab = &mut *slab_ptr;
            let mut cursor = objects;
            for _ in 0..self.objects_per_slab {
                let free_obj = cursor as *mut SlabObject;
                (*free_obj).next = slab.free_list;
                slab.free_list = Some(NonNull::new_unchecked(free_obj));
                cursor = cursor.add(self.aligned_size);
            }

            self.num_slabs += 1;
            Some(NonNull::new_unchecked(slab_ptr))
        }
    }

    /// Return a slab's pages to the buddy, running the destructor on every
    /// slot first.
    fn release_slab(&mut self, slab: NonNull<Slab>) {
        if let Some(dtor) = self.dtor {
            // SAFETY: slab header and its object area are live.
            unsafe {
                let mut cursor = slab.as_ref().objects;
                for _ in 0..self.objects_per_slab {
                    dtor(cursor);
                    cursor = cursor.add(self.aligned_size);
                }
            }
        }

        buddy::free(virt_to_phys(VirtAddr::new(slab.as_ptr() as u64)));
        self.num_slabs -= 1;
    }

    fn alloc(&mut self) -> Option<NonNull<u8>> {
        let mut slab = if let Some(slab) = self.slabs_partial {
            slab
        } else if let Some(slab) = self.slabs_empty {
            slab
        } else {
            let slab = self.allocate_slab()?;
            self.add_slab(slab);
            slab
        };

        // SAFETY: slab is live and exclusively ours under the lock.
        let obj = unsafe {
            let slab = slab.as_mut();
            let obj = slab.free_list?;
            slab.free_list = obj.as_ref().next;
            slab.free_objects -= 1;
            obj.cast::<u8>()
        };

        self.reclassify(slab);

        if let Some(ctor) = self.ctor {
            ctor(obj.as_ptr());
        }

        self.num_allocations += 1;
        self.num_active_objects += 1;
        Some(obj)
    }

    /// Move a slab to the list matching its free-object count.
    fn reclassify(&mut self, mut slab: NonNull<Slab>) {
        // SAFETY: live slab header.
        unsafe {
            let old_state = slab.as_ref().state;
            let new_state = if slab.as_ref().free_objects == 0 {
                SlabState::Full
            } else if slab.as_ref().free_objects == slab.as_ref().num_objects {
                SlabState::Empty
            } else {
                SlabState::Partial
            };

            if old_state != new_state {
                self.remove_slab(slab);
                slab.as_mut().state = new_state;
                self.add_slab(slab);
            }
        }
    }

    /// Find the slab whose object area contains `addr`.
    fn owning_slab(&self, addr: u64) -> Option<NonNull<Slab>> {
        for head in [self.slabs_full, self.slabs_partial, self.slabs_empty] {
            let mut cursor = head;
            while let Some(slab) = cursor {
                // SAFETY: live slab header.
                unsafe {
                    let start = slab.as_ref().objects as u64;
                    let end = start + self.objects_per_slab as u64 * self.aligned_size as u64;
                    if addr >= start && addr < end {
                        return Some(slab);
                    }
                    cursor = slab.as_ref().next;
                }
            }
        }
        None
    }

    fn free(&mut self, ptr: NonNull<u8>) -> bool {
        let Some(mut slab) = self.owning_slab(ptr.as_ptr() as u64) else {
            return false;
        };

        // SAFETY: the pointer belongs to this slab's object area; relinking
        // it as a free slot is the slab discipline.
        unsafe {
            let free_obj = ptr.cast::<SlabObject>();
            free_obj.as_ptr().write(SlabObject {
                next: slab.as_ref().free_list,
            });
            slab.as_mut().free_list = Some(free_obj);
            slab.as_mut().free_objects += 1;
        }

        self.reclassify(slab);
        self.num_frees += 1;
        self.num_active_objects -= 1;
        true
    }

    fn shrink(&mut self) -> u32 {
        let mut freed = 0;
        while let Some(slab) = self.slabs_empty {
            self.remove_slab(slab);
            self.release_slab(slab);
            freed += 1;
        }
        freed
    }
}

/// Create the built-in kmalloc caches.
pub fn init() -> Result<(), KernelError> {
    let mut buckets = [None; KMALLOC_SIZES.len()];
    for (i, &size) in KMALLOC_SIZES.iter().enumerate() {
        let name = match size {
            32 => "kmalloc-32",
            64 => "kmalloc-64",
            128 => "kmalloc-128",
            256 => "kmalloc-256",
            512 => "kmalloc-512",
            1024 => "kmalloc-1024",
            2048 => "kmalloc-2048",
            _ => "kmalloc-4096",
        };
        buckets[i] = Some(cache_create(name, size, None, None)?);
    }

    REGISTRY.lock().kmalloc = buckets;
    serial_println!("[SLAB] Initialized with {} common caches", KMALLOC_SIZES.len());
    Ok(())
}

/// Create a named cache for objects of `object_size` bytes.
pub fn cache_create(
    name: &'static str,
    object_size: usize,
    ctor: Option<fn(*mut u8)>,
    dtor: Option<fn(*mut u8)>,
) -> Result<CacheRef, KernelError> {
    if name.is_empty() || object_size == 0 {
        return Err(KernelError::InvalidArgument);
    }

    let mut registry = REGISTRY.lock();
    if registry.count >= SLAB_MAX_CACHES {
        return Err(KernelError::OutOfMemory);
    }

    let cache_phys = buddy::alloc(core::mem::size_of::<SlabCache>())
        .ok_or(KernelError::OutOfMemory)?;
    let cache_ptr = phys_to_virt(cache_phys).as_mut_ptr::<SlabCache>();

    let aligned_size = align_size(object_size.max(core::mem::size_of::<SlabObject>()), SLAB_ALIGN);
    let slab_order = calculate_slab_order(aligned_size);
    let usable = buddy::size_for_order(slab_order) - slab_header_size();
    let objects_per_slab = (usable / aligned_size) as u32;

    // SAFETY: cache_ptr points at a fresh buddy block sized for SlabCache.
    unsafe {
        cache_ptr.write(SlabCache {
            name,
            object_size,
            aligned_size,
            objects_per_slab,
            slab_order,
            slabs_empty: None,
            slabs_partial: None,
            slabs_full: None,
            num_allocations: 0,
            num_frees: 0,
            num_slabs: 0,
            num_active_objects: 0,
            ctor,
            dtor,
        });
    }

    // SAFETY: freshly written, non-null.
    let cache = CacheRef(unsafe { NonNull::new_unchecked(cache_ptr) });
    let slot = registry.count;
    registry.caches[slot] = Some(cache);
    registry.count += 1;

    Ok(cache)
}

/// Destroy a cache: run destructors, return every slab and the cache struct
/// to the buddy, and drop it from the registry.
pub fn cache_destroy(cache: CacheRef) {
    let mut registry = REGISTRY.lock();

    // SAFETY: exclusive access under the registry lock.
    unsafe {
        let cache_mut = &mut *cache.0.as_ptr();
        for head in [
            cache_mut.slabs_full,
            cache_mut.slabs_partial,
            cache_mut.slabs_empty,
        ] {
            let mut cursor = head;
            while let Some(slab) = cursor {
                cursor = slab.as_ref().next;
                cache_mut.release_slab(slab);
            }
        }
        cache_mut.slabs_full = None;
        cache_mut.slabs_partial = None;
        cache_mut.slabs_empty = None;
    }

    if let Some(pos) = registry.caches.iter().position(|c| *c == Some(cache)) {
        for i in pos..registry.count - 1 {
            registry.caches[i] = registry.caches[i + 1];
        }
        let last = registry.count - 1;
        registry.caches[last] = None;
        registry.count -= 1;
    }

    buddy::free(virt_to_phys(VirtAddr::new(cache.0.as_ptr() as u64)));
}

/// Allocate one object from the cache.
pub fn cache_alloc(cache: CacheRef) -> Option<NonNull<u8>> {
    let _registry = REGISTRY.lock();
    // SAFETY: exclusive access under the registry lock.
    unsafe { (*cache.0.as_ptr()).alloc() }
}

/// Return an object to its cache. Logs and ignores pointers the cache does
/// not own.
pub fn cache_free(cache: CacheRef, ptr: NonNull<u8>) {
    let _registry = REGISTRY.lock();
    // SAFETY: exclusive access under the registry lock.
    let freed = unsafe { (*cache.0.as_ptr()).free(ptr) };
    if !freed {
        serial_println!("[SLAB] Warning: object {:p} not found in any slab", ptr);
    }
}

/// Free all currently-empty slabs of a cache. Returns how many were freed.
pub fn cache_shrink(cache: CacheRef) -> u32 {
    let _registry = REGISTRY.lock();
    // SAFETY: exclusive access under the registry lock.
    unsafe { (*cache.0.as_ptr()).shrink() }
}

/// The kmalloc bucket serving `size`, if `size` fits in a bucket.
pub fn kmalloc_bucket(size: usize) -> Option<CacheRef> {
    if size == 0 {
        return None;
    }
    let registry = REGISTRY.lock();
    for (i, &bucket_size) in KMALLOC_SIZES.iter().enumerate() {
        if size <= bucket_size {
            return registry.kmalloc[i];
        }
    }
    None
}

/// Free a pointer into whichever cache owns it. Returns false when no cache
/// claims the address.
pub fn free_anywhere(ptr: NonNull<u8>) -> bool {
    let registry = REGISTRY.lock();
    for cache in registry.caches.iter().flatten() {
        // SAFETY: exclusive access under the registry lock.
        unsafe {
            if (*cache.0.as_ptr()).owning_slab(ptr.as_ptr() as u64).is_some() {
                return (*cache.0.as_ptr()).free(ptr);
            }
        }
    }
    false
}

/// Object size of the cache owning `ptr`, if any (used by krealloc).
pub fn owning_object_size(ptr: NonNull<u8>) -> Option<usize> {
    let registry = REGISTRY.lock();
    for cache in registry.caches.iter().flatten() {
        // SAFETY: exclusive access under the registry lock.
        unsafe {
            let cache_ref = &*cache.0.as_ptr();
            if cache_ref.owning_slab(ptr.as_ptr() as u64).is_some() {
                return Some(cache_ref.object_size);
            }
        }
    }
    None
}

pub struct CacheStats {
    pub name: &'static str,
    pub object_size: usize,
    pub objects_per_slab: u32,
    pub active_objects: u64,
    pub slabs: u64,
    pub allocations: u64,
    pub frees: u64,
}

/// Snapshot statistics for every registered cache.
pub fn for_each_cache(mut f: impl FnMut(&CacheStats)) {
    let registry = REGISTRY.lock();
    for cache in registry.caches.iter().flatten() {
        // SAFETY: read access under the registry lock.
        let stats = unsafe {
            let c = &*cache.0.as_ptr();
            CacheStats {
                name: c.name,
                object_size: c.object_size,
                objects_per_slab: c.objects_per_slab,
                active_objects: c.num_active_objects,
                slabs: c.num_slabs,
                allocations: c.num_allocations,
                frees: c.num_frees,
            }
        };
        f(&stats);
    }
}

pub fn print_stats() {
    println!("\n=== Slab Allocator Statistics ===");
    for_each_cache(|stats| {
        println!("\nCache: {}", stats.name);
        println!("  Object size:    {} bytes", stats.object_size);
        println!("  Objects/slab:   {}", stats.objects_per_slab);
        println!("  Active objects: {}", stats.active_objects);
        println!("  Total slabs:    {}", stats.slabs);
        println!("  Allocations:    {}", stats.allocations);
        println!("  Frees:          {}", stats.frees);
    });
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn freed_object_is_reused() {
        let cache = cache_create("test-reuse", 48, None, None).unwrap();
        let a = cache_alloc(cache).unwrap();
        cache_free(cache, a);
        let b = cache_alloc(cache).unwrap();
        assert_eq!(a, b);
        cache_free(cache, b);
        cache_destroy(cache);
    }

    #[test_case]
    fn shrink_drops_idle_slabs() {
        let cache = cache_create("test-shrink", 64, None, None).unwrap();
        let a = cache_alloc(cache).unwrap();
        cache_free(cache, a);
        // One slab exists and it is now empty.
        assert!(cache_shrink(cache) >= 1);
        cache_destroy(cache);
    }

    #[test_case]
    fn active_count_tracks_alloc_minus_free() {
        let cache = cache_create("test-count", 96, None, None).unwrap();
        let a = cache_alloc(cache).unwrap();
        let b = cache_alloc(cache).unwrap();

        let mut active = 0;
        for_each_cache(|stats| {
            if stats.name == "test-count" {
                active = stats.active_objects;
            }
        });
        assert_eq!(active, 2);

        cache_free(cache, a);
        cache_free(cache, b);
        cache_destroy(cache);
    }

    #[test_case]
    fn constructor_runs_on_alloc() {
        fn fill(obj: *mut u8) {
            // SAFETY: called on a live slot of at least 32 bytes.
            unsafe { obj.write_bytes(0xAB, 32) };
        }

        let cache = cache_create("test-ctor", 32, Some(fill), None).unwrap();
        let obj = cache_alloc(cache).unwrap();
        // SAFETY: obj is a live 32-byte slot.
        unsafe {
            assert_eq!(obj.as_ptr().read(), 0xAB);
        }
        cache_free(cache, obj);
        cache_destroy(cache);
    }

    #[test_case]
    fn kmalloc_buckets_round_up() {
        let small = kmalloc_bucket(1).unwrap();
        let also_32 = kmalloc_bucket(32).unwrap();
        assert_eq!(small, also_32);
        assert!(kmalloc_bucket(4097).is_none());
    }
}
