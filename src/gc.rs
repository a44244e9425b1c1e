// Heart of the collector: the tagged header word, size-class pools carved
// out of pages, the big object list, and the stop-the-world driver that
// ties marking and sweeping together.

use bit_field::BitField;
use c_interface::*;
use libc;
use marking::Marking;
use pages::*;
use std::env;
use std::mem;
use std::num;
use std::ptr;

pub const N_POOLS: usize = 16;

// payload size classes; anything larger than the last class goes to the
// big object list
pub static SIZE_CLASSES: [usize; N_POOLS] = [8, 16, 24, 32, 48, 64, 96, 128,
                                             192, 256, 384, 512, 768, 1024, 1536, 2048];

pub const MAX_POOL_OBJ_SZ: usize = 2048;

// bytes of allocation after which the next allocation triggers a collection
pub const DEFAULT_COLLECT_INTERVAL: usize = 8192 * 1024;

// Errors that can be encountered while reading collector configuration
#[derive(Debug)]
pub enum GcInitError {
    Parse(num::ParseIntError),
    Env(env::VarError),
}

// The header word sitting one word before every payload. It has three
// overlapping readings: a live cell keeps its mark bit in bit 0 and its
// finalize bit in bit 1 with all upper bits zero; a cell on a pool
// freelist stores the next-free pointer in the whole word (cell alignment
// keeps the two flag bits zero there); and any header whose upper bits are
// non-zero is therefore a free cell. The one ambiguous pattern is the all
// zero word, which is both an unmarked live cell and the null freelist
// terminator; sweeping threads both, so the ambiguity never leaks.
#[repr(C)]
pub struct VlTaggedValue {
    pub header: usize,
}

// Decoded reading of a header word. The discriminant is recovered from the
// stored bits; the all-zero word decodes as an unmarked live cell.
#[derive(Debug, PartialEq)]
pub enum HeaderState {
    Live { marked: bool, finalize: bool },
    Free { next: *mut VlTaggedValue },
}

impl VlTaggedValue {
    #[inline(always)]
    pub fn marked(&self) -> bool {
        self.header.get_bit(0)
    }

    #[inline(always)]
    pub fn set_marked(&mut self, flag: bool) {
        self.header.set_bit(0, flag);
    }

    #[inline(always)]
    pub fn finalize(&self) -> bool {
        self.header.get_bit(1)
    }

    #[inline(always)]
    pub fn set_finalize(&mut self, flag: bool) {
        self.header.set_bit(1, flag);
    }

    // a cell is free iff the bits above the two flag bits form a pointer
    #[inline(always)]
    pub fn is_free(&self) -> bool {
        self.header & !0x3 != 0
    }

    // next-free link; meaningful only while the cell is on a freelist
    #[inline(always)]
    pub fn next_free(&self) -> *mut VlTaggedValue {
        self.header as *mut VlTaggedValue
    }

    pub fn state(&self) -> HeaderState {
        if self.is_free() {
            HeaderState::Free { next: self.next_free() }
        } else {
            HeaderState::Live {
                marked: self.marked(),
                finalize: self.finalize(),
            }
        }
    }
}

// header <-> payload conversions; the payload the mutator sees starts one
// word past the header
#[inline(always)]
pub fn as_tagged_value(v: *const VlValue) -> *const VlTaggedValue {
    unsafe { (v as *const VlTaggedValue).offset(-1) }
}

#[inline(always)]
pub fn as_mut_tagged_value(v: *mut VlValue) -> *mut VlTaggedValue {
    unsafe { (v as *mut VlTaggedValue).offset(-1) }
}

#[inline(always)]
pub fn value_of_mut(t: *mut VlTaggedValue) -> *mut VlValue {
    unsafe { t.offset(1) as *mut VlValue }
}

// Smallest class whose payload holds `sz` bytes, as a fixed branching tree.
#[inline(always)]
pub fn szclass(sz: usize) -> usize {
    debug_assert!(sz <= MAX_POOL_OBJ_SZ);
    if sz <= 8 {
        return 0;
    }
    if sz <= 128 {
        if sz <= 16 {
            return 1;
        }
        if sz <= 32 {
            if sz <= 24 {
                return 2;
            }
            return 3;
        }
        if sz <= 64 {
            if sz <= 48 {
                return 4;
            }
            return 5;
        }
        if sz <= 96 {
            return 6;
        }
        return 7;
    }
    if sz <= 512 {
        if sz <= 256 {
            if sz <= 192 {
                return 8;
            }
            return 9;
        }
        if sz <= 384 {
            return 10;
        }
        return 11;
    }
    if sz <= 1024 {
        if sz <= 768 {
            return 12;
        }
        return 13;
    }
    if sz <= 1536 {
        return 14;
    }
    15
}

// Per size class: cell size (payload plus the header word), the pages this
// pool owns, and a freelist threading free cells across those pages.
pub struct GcPool {
    pub osize: usize,
    pub pages: *mut Page,
    pub freelist: *mut VlTaggedValue,
}

impl GcPool {
    fn new(payload_sz: usize) -> GcPool {
        GcPool {
            osize: payload_sz + mem::size_of::<VlTaggedValue>(),
            pages: ptr::null_mut(),
            freelist: ptr::null_mut(),
        }
    }

    // number of cells carved out of one page of this class
    pub fn cells_per_page(&self) -> usize {
        (PAGE_SZ - mem::size_of::<usize>()) / self.osize
    }

    // whether `p` points into one of this pool's pages
    pub fn owns(&self, p: *const u8) -> bool {
        let mut pg = self.pages;
        while !pg.is_null() {
            unsafe {
                if (*pg).contains(p) {
                    return true;
                }
                pg = (*pg).next;
            }
        }
        false
    }
}

// A big object record: the list link, the tagged header, then the payload.
#[repr(C)]
pub struct BigVal {
    pub next: *mut BigVal,
    pub tag: VlTaggedValue,
}

impl BigVal {
    #[inline(always)]
    pub fn value_mut(&mut self) -> *mut VlValue {
        value_of_mut(&mut self.tag as *mut VlTaggedValue)
    }

    // recover the record from its payload pointer
    pub fn from_value(v: *mut VlValue) -> *mut BigVal {
        unsafe { (v as *mut u8).offset(-(mem::size_of::<BigVal>() as isize)) as *mut BigVal }
    }
}

// Collector statistics. `allocd` is the bytes-since-last-collection
// counter that drives the trigger; `freed` counts pool cells that read as
// allocated-and-unmarked while sweeping, which includes the one freelist
// terminator cell per rebuilt list, so treat it as an upper bound.
#[repr(C)]
pub struct GcNum {
    pub allocd: usize,
    pub total_allocd: u64,
    pub freed: u64,
    pub poolalloc: u64,
    pub bigalloc: u64,
    pub bigfreed: u64,
    pub collections: u64,
    pub interval: usize,
}

impl GcNum {
    fn new(interval: usize) -> GcNum {
        GcNum {
            allocd: 0,
            total_allocd: 0,
            freed: 0,
            poolalloc: 0,
            bigalloc: 0,
            bigfreed: 0,
            collections: 0,
            interval: interval,
        }
    }
}

pub struct Finalizer {
    obj: *mut VlValue,
    fun: FinalizerFn,
}

// The collector. All process-wide state lives here and is threaded
// explicitly through every entry point, so each embedding (and each test)
// gets its own independent heap.
pub struct Gc {
    pub pools: Vec<GcPool>, // N_POOLS entries
    pub big_objects: *mut BigVal,
    pub gc_num: GcNum,
    pub page_mgr: PageMgr,
    pub marking: Marking,
    pub roots: RtRoots,
    finalizers: Vec<Finalizer>,
    to_finalize: Vec<Finalizer>,
}

impl Gc {
    pub fn new(hooks: RtHooks) -> Gc {
        let mut pools = Vec::with_capacity(N_POOLS);
        for sz in SIZE_CLASSES.iter() {
            pools.push(GcPool::new(*sz));
        }

        // the collect interval can be pinned down through the environment
        let interval = match env::var("TRITON_COLLECT_INTERVAL")
            .map_err(GcInitError::Env)
            .and_then(|s| s.parse::<usize>().map_err(GcInitError::Parse))
        {
            Ok(n) => n,
            Err(GcInitError::Env(env::VarError::NotPresent)) => DEFAULT_COLLECT_INTERVAL,
            Err(_) => panic!("Expected environment variable TRITON_COLLECT_INTERVAL to be a byte count."),
        };

        Gc {
            pools: pools,
            big_objects: ptr::null_mut(),
            gc_num: GcNum::new(interval),
            page_mgr: PageMgr::new(),
            marking: Marking::new(hooks),
            roots: RtRoots::empty(),
            finalizers: Vec::new(),
            to_finalize: Vec::new(),
        }
    }

    pub fn set_roots(&mut self, roots: RtRoots) {
        self.roots = roots;
    }

    // process-wide tunable; never shrunk by the collector itself
    pub fn set_collect_interval(&mut self, interval: usize) {
        self.gc_num.interval = interval;
    }

    // The allocation front door. The threshold check here is the only
    // point where the mutator can be suspended for a collection.
    pub fn allocate(&mut self, sz: usize) -> *mut VlValue {
        if self.gc_num.allocd > self.gc_num.interval {
            self.collect();
        }
        self.gc_num.allocd += sz;
        if sz > MAX_POOL_OBJ_SZ {
            self.big_alloc(sz)
        } else {
            self.pool_alloc(szclass(sz))
        }
    }

    pub fn pool_alloc(&mut self, pool_i: usize) -> *mut VlValue {
        debug_assert_eq!(self.pools[pool_i].osize,
                         SIZE_CLASSES[pool_i] + mem::size_of::<VlTaggedValue>(),
                         "GC: pool does not match its size class!");
        if self.pools[pool_i].freelist.is_null() {
            self.add_page(pool_i);
        }
        let p = &mut self.pools[pool_i];
        debug_assert!(!p.freelist.is_null());
        let v = p.freelist;
        unsafe {
            p.freelist = (*v).next_free();
            (*v).header = 0; // live, unmarked, no finalizer
        }
        self.gc_num.poolalloc += 1;
        value_of_mut(v)
    }

    // Carve a fresh page into cells in ascending address order and splice
    // them onto the head of the pool's freelist; the last carved cell
    // continues into whatever the freelist held before.
    fn add_page(&mut self, pool_i: usize) {
        let pg = self.page_mgr.alloc_page();
        let p = &mut self.pools[pool_i];
        unsafe {
            let lim = (pg as *mut u8).add(PAGE_SZ - p.osize);
            let mut v = (*pg).data.as_mut_ptr() as *mut VlTaggedValue;
            let oldfl = p.freelist;
            let mut pfl: *mut *mut VlTaggedValue = &mut p.freelist;
            while v as *mut u8 <= lim {
                *pfl = v;
                pfl = v as *mut *mut VlTaggedValue; // the header word is the next link
                v = (v as *mut u8).add(p.osize) as *mut VlTaggedValue;
            }
            *pfl = oldfl;
            (*pg).next = p.pages;
            p.pages = pg;
        }
    }

    pub fn big_alloc(&mut self, sz: usize) -> *mut VlValue {
        let allocsz = match sz.checked_add(mem::size_of::<BigVal>()) {
            Some(s) => s,
            None => panic!("GC: requested object is too large to represent with native pointer size!"),
        };
        let v = unsafe { libc::malloc(allocsz) as *mut BigVal };
        if v.is_null() {
            panic!("GC: out of memory, cannot allocate big object!");
        }
        unsafe {
            (*v).next = self.big_objects;
            (*v).tag.header = 0;
        }
        self.big_objects = v;
        self.gc_num.bigalloc += 1;
        unsafe { (*v).value_mut() }
    }

    // One full stop-the-world cycle: mark everything reachable from the
    // root set, queue dead finalizable objects, then sweep big objects and
    // every pool in class-index order.
    pub fn collect(&mut self) {
        let roots = self.roots;
        self.marking.walk_roots(&roots);
        self.queue_dead_finalizers();
        self.sweep_big();
        {
            let Gc { ref mut pools, ref mut page_mgr, ref mut gc_num, .. } = *self;
            for p in pools.iter_mut() {
                Gc::sweep_pool(p, page_mgr, gc_num);
            }
        }
        self.verify_freelists();
        self.gc_num.total_allocd += self.gc_num.allocd as u64;
        self.gc_num.allocd = 0;
        self.gc_num.collections += 1;
    }

    // Unlink and free every unmarked record, clear the mark on survivors.
    // Retained records keep their order; the newest stays at the head.
    fn sweep_big(&mut self) {
        unsafe {
            let mut pv: *mut *mut BigVal = &mut self.big_objects;
            let mut v = self.big_objects;
            while !v.is_null() {
                let nxt = (*v).next;
                if (*v).tag.marked() {
                    (*v).tag.set_marked(false);
                    pv = &mut (*v).next;
                } else {
                    *pv = nxt;
                    libc::free(v as *mut libc::c_void);
                    self.gc_num.bigfreed += 1;
                }
                v = nxt;
            }
        }
    }

    // Sweep one pool page by page, rebuilding its freelist: free cells and
    // unmarked cells are threaded in ascending address order, marked cells
    // get their mark bit cleared. A page left with no marked cell goes
    // back to the page allocator, and the freelist tail is rewound to
    // where it stood before that page so no link dangles into freed
    // memory.
    fn sweep_pool(p: &mut GcPool, page_mgr: &mut PageMgr, gc_num: &mut GcNum) {
        unsafe {
            let mut pfl: *mut *mut VlTaggedValue = &mut p.freelist;
            let mut ppg: *mut *mut Page = &mut p.pages;
            let mut pg = p.pages;
            while !pg.is_null() {
                let lim = (pg as *mut u8).add(PAGE_SZ - p.osize);
                let mut v = (*pg).data.as_mut_ptr() as *mut VlTaggedValue;
                let mut has_live = false;
                let prev_pfl = pfl;
                while v as *mut u8 <= lim {
                    if !(*v).is_free() && (*v).marked() {
                        (*v).set_marked(false);
                        has_live = true;
                    } else {
                        if !(*v).is_free() {
                            gc_num.freed += p.osize as u64;
                        }
                        *pfl = v;
                        pfl = v as *mut *mut VlTaggedValue;
                    }
                    v = (v as *mut u8).add(p.osize) as *mut VlTaggedValue;
                }
                let nextpg = (*pg).next;
                if !has_live {
                    // nothing reachable on this page: drop its cells from
                    // the rebuilt freelist and give the page back
                    pfl = prev_pfl;
                    *ppg = nextpg;
                    page_mgr.free_page(pg);
                } else {
                    ppg = &mut (*pg).next;
                }
                pg = nextpg;
            }
            *pfl = ptr::null_mut();
        }
    }

    pub fn register_finalizer(&mut self, v: *mut VlValue, f: FinalizerFn) {
        unsafe {
            (*as_mut_tagged_value(v)).set_finalize(true);
        }
        self.finalizers.push(Finalizer { obj: v, fun: f });
    }

    // A registration stays on the list while its object is alive. A dead
    // object moves to the to_finalize queue with its finalize bit cleared
    // and its mark bit set, so it survives exactly this sweep and is
    // reclaimed on the next cycle unless a root resurrects it.
    fn queue_dead_finalizers(&mut self) {
        let mut i = 0;
        while i < self.finalizers.len() {
            let dead = unsafe { !(*as_tagged_value(self.finalizers[i].obj)).marked() };
            if dead {
                let f = self.finalizers.swap_remove(i);
                unsafe {
                    let tag = &mut *as_mut_tagged_value(f.obj);
                    tag.set_finalize(false);
                    tag.set_marked(true);
                }
                self.to_finalize.push(f);
            } else {
                i += 1;
            }
        }
    }

    // Run queued finalizers. When to call this is the host's decision; no
    // ordering between the callbacks is promised.
    pub fn run_finalizers(&mut self) {
        while let Some(f) = self.to_finalize.pop() {
            (f.fun)(f.obj);
        }
    }

    // verify the freelist chains look valid
    fn verify_freelists(&self) {
        if cfg!(feature = "memfence") {
            for p in self.pools.iter() {
                let mut v = p.freelist;
                while !v.is_null() {
                    unsafe {
                        debug_assert!(!(*v).marked(), "GC: marked cell on a freelist!");
                        debug_assert!(p.owns(v as *const u8),
                                      "GC: freelist cell outside the pool's pages!");
                        v = (*v).next_free();
                    }
                }
            }
        }
    }
}

// Give every page and big object record back to the host allocator.
impl Drop for Gc {
    fn drop(&mut self) {
        unsafe {
            for p in self.pools.iter_mut() {
                let mut pg = p.pages;
                while !pg.is_null() {
                    let nxt = (*pg).next;
                    libc::free(pg as *mut libc::c_void);
                    pg = nxt;
                }
                p.pages = ptr::null_mut();
                p.freelist = ptr::null_mut();
            }
            let mut v = self.big_objects;
            while !v.is_null() {
                let nxt = (*v).next;
                libc::free(v as *mut libc::c_void);
                v = nxt;
            }
            self.big_objects = ptr::null_mut();
        }
    }
}

#[cfg(test)]
impl Gc {
    pub fn freelist_len(&self, pool_i: usize) -> usize {
        let mut n = 0;
        let mut v = self.pools[pool_i].freelist;
        while !v.is_null() {
            n += 1;
            v = unsafe { (*v).next_free() };
        }
        n
    }

    pub fn freelist_contains(&self, pool_i: usize, cell: *const VlTaggedValue) -> bool {
        let mut v = self.pools[pool_i].freelist;
        while !v.is_null() {
            if v as *const VlTaggedValue == cell {
                return true;
            }
            v = unsafe { (*v).next_free() };
        }
        false
    }
}

#[cfg(test)]
mod tagged_value_tests {
    use super::*;

    #[test]
    fn test_flag_bits() {
        let mut t = VlTaggedValue { header: 0 };
        assert!(!t.marked());
        assert!(!t.finalize());
        assert!(!t.is_free());

        t.set_marked(true);
        assert!(t.marked());
        assert!(!t.is_free());
        t.set_finalize(true);
        assert!(t.finalize());
        assert!(t.marked());
        assert!(!t.is_free());

        t.set_marked(false);
        assert!(!t.marked());
        assert!(t.finalize());
    }

    #[test]
    fn test_free_pointer_pun() {
        // any word-aligned pointer has zero flag bits, so storing it in the
        // header flips the cell to the free reading
        let mut t = VlTaggedValue { header: 0x7f00_1000 };
        assert!(t.is_free());
        assert!(!t.marked());
        assert_eq!(t.next_free() as usize, 0x7f00_1000);

        t.header = 0;
        assert!(!t.is_free());
        assert!(t.next_free().is_null());
    }

    #[test]
    fn test_state_decode() {
        let t = VlTaggedValue { header: 0x1 };
        assert_eq!(t.state(), HeaderState::Live { marked: true, finalize: false });

        let t = VlTaggedValue { header: 0x2 };
        assert_eq!(t.state(), HeaderState::Live { marked: false, finalize: true });

        let t = VlTaggedValue { header: 0x4000 };
        assert_eq!(t.state(),
                   HeaderState::Free { next: 0x4000 as *mut VlTaggedValue });

        // the null terminator decodes as an unmarked live cell; sweep
        // threads both readings, so nothing depends on telling them apart
        let t = VlTaggedValue { header: 0 };
        assert_eq!(t.state(), HeaderState::Live { marked: false, finalize: false });
    }
}
