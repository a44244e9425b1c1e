// Page allocator for the GC. Pages are fixed-size raw blocks obtained from
// the host allocator on demand; an emptied page is returned immediately,
// there is no caching layer in between.

use libc;
use std::mem;
use std::ptr;

pub const PAGE_LG2: usize = 14; // log_2(PAGE_SZ)
pub const PAGE_SZ: usize = 1 << PAGE_LG2; // 16k

// A GC page: a link to the next page owned by the same pool, followed by a
// data area that gets carved into uniform cells of a single size class.
#[repr(C)]
pub struct Page {
    pub next: *mut Page,
    pub data: [u8; PAGE_SZ - mem::size_of::<usize>()],
}

impl Page {
    // whether `p` points into this page's data area
    pub fn contains(&self, p: *const u8) -> bool {
        let begin = self.data.as_ptr() as usize;
        let end = self as *const Page as usize + PAGE_SZ;
        let p = p as usize;
        p >= begin && p < end
    }
}

pub struct PageMgr {
    pub current_pg_count: usize,
    pub freed_pg_count: usize,
}

impl PageMgr {
    pub fn new() -> PageMgr {
        PageMgr {
            current_pg_count: 0,
            freed_pg_count: 0,
        }
    }

    // Obtain one page-sized, word-aligned block from the host.
    #[inline(never)]
    pub fn alloc_page(&mut self) -> *mut Page {
        let pg = unsafe { libc::malloc(PAGE_SZ) as *mut Page };
        if pg.is_null() {
            panic!("GC: out of memory, cannot allocate page!");
        }
        unsafe {
            (*pg).next = ptr::null_mut();
        }
        self.current_pg_count += 1;
        pg
    }

    // Return a page to the host.
    pub fn free_page(&mut self, pg: *mut Page) {
        debug_assert!(!pg.is_null(), "GC: tried to free a null page!");
        unsafe {
            libc::free(pg as *mut libc::c_void);
        }
        self.current_pg_count -= 1;
        self.freed_pg_count += 1;
    }
}
