// C interface for the garbage collector. The vela runtime owns the value
// representation; this module pins down the struct layouts the collector
// reads while tracing, the hook table and root set the runtime hands over
// at initialization, and the entry points exported to the C side. The
// collector itself is a plain value (`Gc`) so that every embedding gets an
// independent heap instead of sharing process globals.

use gc::Gc;
use libc::c_void;
use marking::Marking;

pub type VlValue = c_void;
pub type VlSym = c_void;

// finalizer callback, invoked with the payload pointer of the dead object
pub type FinalizerFn = extern "C" fn(v: *mut VlValue);

// Closed sum of runtime value kinds the tracer dispatches on. `Bits` is a
// value of a bits type (opaque bytes, a leaf of the object graph);
// `BitsType` is the type object itself. `Struct` is the generic struct
// instance catch-all.
#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum VlKind {
    Bits = 0,
    Array,
    Tuple,
    LambdaInfo,
    Func,
    TypeName,
    TagType,
    StructType,
    BitsType,
    MethTable,
    Task,
    Struct,
}

pub type TypeOfFn = extern "C" fn(v: *mut VlValue) -> *mut VlValue;
pub type KindOfFn = extern "C" fn(v: *mut VlValue) -> VlKind;
pub type MarkTypeCacheFn = extern "C" fn(marking: *mut Marking);

// Dispatch table the runtime supplies at initialization. `mark_type_cache`
// is handed the tracer and is expected to call triton_mark_value for every
// entry of the runtime's global type cache.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct RtHooks {
    pub type_of: TypeOfFn,
    pub kind_of: KindOfFn,
    pub mark_type_cache: MarkTypeCacheFn,
}

// The fixed root set. Null slots are skipped while marking so a partially
// initialized runtime can already collect.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct RtRoots {
    pub current_task: *mut VlValue,
    pub root_task: *mut VlValue,
    pub system_module: *mut VlModule,
    pub user_module: *mut VlModule,
    pub methtable_type: *mut VlValue,
    pub bottom_func: *mut VlValue,
    pub any_func: *mut VlValue,
    pub null_value: *mut VlValue,
    pub true_value: *mut VlValue,
    pub false_value: *mut VlValue,
}

impl RtRoots {
    pub fn empty() -> RtRoots {
        RtRoots {
            current_task: ::std::ptr::null_mut(),
            root_task: ::std::ptr::null_mut(),
            system_module: ::std::ptr::null_mut(),
            user_module: ::std::ptr::null_mut(),
            methtable_type: ::std::ptr::null_mut(),
            bottom_func: ::std::ptr::null_mut(),
            any_func: ::std::ptr::null_mut(),
            null_value: ::std::ptr::null_mut(),
            true_value: ::std::ptr::null_mut(),
            false_value: ::std::ptr::null_mut(),
        }
    }
}

//------------------------------------------------------------------------------
// Value layouts the tracer reads

#[repr(C)]
pub struct VlArray {
    pub dims: *mut VlValue,
    pub data: *mut c_void,
    pub length: usize,
    // inline element storage begins here; `data` points at it for small
    // arrays and at a separate heap buffer otherwise
    pub _space: [u8; 0],
}

impl VlArray {
    #[inline(always)]
    pub fn data_is_inline(&self) -> bool {
        self.data as *const u8 == self._space.as_ptr()
    }
}

#[repr(C)]
pub struct VlTuple {
    pub length: usize,
}

impl VlTuple {
    // elements are stored immediately after the length word
    #[inline(always)]
    pub unsafe fn data(&self) -> *mut *mut VlValue {
        (self as *const VlTuple).offset(1) as *mut *mut VlValue
    }

    #[inline(always)]
    pub unsafe fn elem(&self, i: usize) -> *mut VlValue {
        *self.data().add(i)
    }
}

#[repr(C)]
pub struct VlLambdaInfo {
    pub ast: *mut VlValue,
    pub sparams: *mut VlValue,
    pub tfunc: *mut VlValue,
    pub roots: *mut VlValue,
    pub spec_types: *mut VlValue,
    pub unspecialized: *mut VlValue,
}

#[repr(C)]
pub struct VlFunction {
    pub fptr: *mut c_void,
    pub env: *mut VlValue,
    pub linfo: *mut VlValue,
}

#[repr(C)]
pub struct VlTypeName {
    pub name: *mut VlSym,
    pub primary: *mut VlValue,
}

// Tag types, struct types and bits types share the function-like prefix,
// so the first type parameter of any of them can be read through the tag
// type layout.
#[repr(C)]
pub struct VlTagType {
    pub fptr: *mut c_void,
    pub env: *mut VlValue,
    pub linfo: *mut VlValue,
    pub name: *mut VlValue,
    pub super_t: *mut VlValue,
    pub parameters: *mut VlTuple,
}

#[repr(C)]
pub struct VlStructType {
    pub fptr: *mut c_void,
    pub env: *mut VlValue,
    pub linfo: *mut VlValue,
    pub name: *mut VlValue,
    pub super_t: *mut VlValue,
    pub parameters: *mut VlTuple,
    pub names: *mut VlTuple,
    pub types: *mut VlTuple,
    pub ctor_factory: *mut VlValue,
    pub instance: *mut VlValue,
}

#[repr(C)]
pub struct VlBitsType {
    pub fptr: *mut c_void,
    pub env: *mut VlValue,
    pub linfo: *mut VlValue,
    pub name: *mut VlValue,
    pub super_t: *mut VlValue,
    pub parameters: *mut VlTuple,
    pub bnbits: *mut VlValue,
    pub nbits: u32,
}

// first type parameter of a type value
#[inline(always)]
pub unsafe fn tparam0(ty: *mut VlValue) -> *mut VlValue {
    let tt = ty as *const VlTagType;
    (*(*tt).parameters).elem(0)
}

#[repr(C)]
pub struct VlMethList {
    pub sig: *mut VlValue,
    pub tvars: *mut VlValue,
    pub func: *mut VlValue,
    pub next: *mut VlMethList,
}

#[repr(C)]
pub struct VlMethTable {
    pub name: *mut VlSym,
    pub defs: *mut VlMethList,
    pub cache: *mut VlMethList,
    pub cache_1arg: *mut *mut VlValue,
    pub n_1arg: usize,
}

#[repr(C)]
pub struct VlTask {
    pub on_exit: *mut VlValue,
    pub start: *mut VlValue,
    pub result: *mut VlValue,
    pub eh_task: *mut VlValue,
    pub gc_frames: *mut GcFrame,
    pub output_stream: *mut VlValue,
}

// A frame of task roots: an array of reference slots plus the link to the
// previous frame.
#[repr(C)]
pub struct GcFrame {
    pub roots: *mut *mut VlValue,
    pub nroots: usize,
    pub prev: *mut GcFrame,
}

//------------------------------------------------------------------------------
// Module binding tables

pub const HT_N_INLINE: usize = 32;

// The runtime's open-addressed hashtable: `table` is a flat array of
// (key, value) pairs, `size` counts the words of that array. Unused value
// slots hold the not-found sentinel.
#[repr(C)]
pub struct HTable {
    pub size: usize,
    pub table: *mut *mut c_void,
    pub _space: [*mut c_void; HT_N_INLINE],
}

impl HTable {
    #[inline(always)]
    pub fn is_not_found(entry: *mut c_void) -> bool {
        entry as usize == 1
    }
}

#[repr(C)]
pub struct VlModule {
    pub name: *mut VlSym,
    pub bindings: HTable,
}

#[repr(C)]
pub struct VlBinding {
    pub name: *mut VlSym,
    pub value: *mut VlValue,
    pub ty: *mut VlValue,
}

//------------------------------------------------------------------------------
// GC entry points

#[no_mangle]
pub extern "C" fn triton_gc_init(hooks: RtHooks) -> Box<Gc> {
    Box::new(Gc::new(hooks))
}

// Clean up all collector memory; the Gc passed in becomes unusable.
#[no_mangle]
pub extern "C" fn triton_gc_drop(_gc: Box<Gc>) {}

#[no_mangle]
pub extern "C" fn triton_set_roots(gc: &mut Gc, roots: RtRoots) {
    gc.set_roots(roots);
}

// The sole allocation entry point: `sz` payload bytes, routed to a pool or
// the big object list.
#[no_mangle]
pub extern "C" fn triton_alloc(gc: &mut Gc, sz: usize) -> *mut VlValue {
    gc.allocate(sz)
}

#[no_mangle]
pub extern "C" fn triton_collect(gc: &mut Gc) {
    gc.collect();
}

// Re-enter the tracer; valid only while a mark phase is running (type
// cache callback, runtime-defined kind handlers).
#[no_mangle]
pub unsafe extern "C" fn triton_mark_value(marking: *mut Marking, v: *mut VlValue) {
    (*marking).mark_value(v);
}

#[no_mangle]
pub extern "C" fn triton_register_finalizer(gc: &mut Gc, v: *mut VlValue, f: FinalizerFn) {
    gc.register_finalizer(v, f);
}

#[no_mangle]
pub extern "C" fn triton_run_finalizers(gc: &mut Gc) {
    gc.run_finalizers();
}

#[no_mangle]
pub extern "C" fn triton_set_collect_interval(gc: &mut Gc, interval: usize) {
    gc.set_collect_interval(interval);
}
