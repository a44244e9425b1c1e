// Marking half of the collector: a precise, type-directed traversal of the
// value graph starting from the runtime's root set. The mark bit is set
// before descending into children, so cyclic graphs terminate. Recursion
// depth is bounded; anything deeper spills onto an explicit mark stack and
// is rescanned from depth zero, which keeps long linked structures from
// overflowing the native stack.

use c_interface::*;
use gc::*;

// recursion depth at which traversal switches to the mark stack
const MAX_MARK_DEPTH: i32 = 40;

pub struct Marking {
    mark_stack: Vec<*mut VlValue>,
    hooks: RtHooks,
}

impl Marking {
    pub fn new(hooks: RtHooks) -> Marking {
        Marking {
            mark_stack: Vec::new(),
            hooks: hooks,
        }
    }

    // Mark all roots, then drain everything queued on the mark stack.
    pub fn walk_roots(&mut self, roots: &RtRoots) {
        debug_assert!(self.mark_stack.is_empty());

        // active tasks
        self.push_root_if_not_null(roots.root_task, 0);
        self.push_root_if_not_null(roots.current_task, 0);

        // modules
        if !roots.system_module.is_null() {
            self.mark_module(roots.system_module);
        }
        if !roots.user_module.is_null() {
            self.mark_module(roots.user_module);
        }

        // invisible builtin values
        self.push_root_if_not_null(roots.methtable_type, 0);
        self.push_root_if_not_null(roots.bottom_func, 0);
        self.push_root_if_not_null(roots.any_func, 0);

        // constants
        self.push_root_if_not_null(roots.null_value, 0);
        self.push_root_if_not_null(roots.true_value, 0);
        self.push_root_if_not_null(roots.false_value, 0);

        // the global type cache is owned by the runtime; its callback
        // re-enters the tracer through triton_mark_value
        let me: *mut Marking = self;
        (self.hooks.mark_type_cache)(me);

        self.visit_mark_stack();
    }

    // Re-entrant marking entry, for the type cache callback and for
    // runtime-defined kind handlers.
    #[inline(always)]
    pub fn mark_value(&mut self, v: *mut VlValue) {
        self.push_root(v, 0);
    }

    #[inline(always)]
    fn push_root_if_not_null(&mut self, v: *mut VlValue, d: i32) {
        if !v.is_null() {
            self.push_root(v, d);
        }
    }

    fn push_root(&mut self, v: *mut VlValue, d: i32) {
        debug_assert!(!v.is_null(), "GC: traced a null value!");
        let o = unsafe { &mut *as_mut_tagged_value(v) };
        if o.marked() {
            return;
        }
        o.set_marked(true);
        self.scan_value(v, d);
    }

    // Scan the children of an already-marked value, dispatching on its
    // runtime kind.
    fn scan_value(&mut self, v: *mut VlValue, d: i32) {
        let d = d + 1;
        if d >= MAX_MARK_DEPTH {
            // too deep; queue the value and rescan it from depth zero later
            self.mark_stack.push(v);
            return;
        }

        match (self.hooks.kind_of)(v) {
            // opaque bytes, no children
            VlKind::Bits => {}
            VlKind::Array => unsafe {
                self.scan_array(v, d);
            },
            VlKind::Tuple => unsafe {
                let t = &*(v as *const VlTuple);
                for i in 0..t.length {
                    let elt = t.elem(i);
                    if !elt.is_null() {
                        self.push_root(elt, d);
                    }
                }
            },
            VlKind::LambdaInfo => unsafe {
                let li = &*(v as *const VlLambdaInfo);
                self.push_root(li.ast, d);
                self.push_root(li.sparams, d);
                self.push_root(li.tfunc, d);
                self.push_root(li.roots, d);
                self.push_root(li.spec_types, d);
                if !li.unspecialized.is_null() {
                    self.push_root(li.unspecialized, d);
                }
            },
            VlKind::Func => unsafe {
                let f = &*(v as *const VlFunction);
                if !f.env.is_null() {
                    self.push_root(f.env, d);
                }
                if !f.linfo.is_null() {
                    self.push_root(f.linfo, d);
                }
            },
            VlKind::TypeName => unsafe {
                let tn = &*(v as *const VlTypeName);
                if !tn.primary.is_null() {
                    self.push_root(tn.primary, d);
                }
            },
            VlKind::TagType => unsafe {
                let tt = &*(v as *const VlTagType);
                debug_assert!(tt.env.is_null());
                debug_assert!(tt.linfo.is_null());
                self.push_root(tt.name, d);
                self.push_root(tt.super_t, d);
                self.push_root(tt.parameters as *mut VlValue, d);
            },
            VlKind::StructType => unsafe {
                let st = &*(v as *const VlStructType);
                if !st.env.is_null() {
                    self.push_root(st.env, d);
                }
                if !st.linfo.is_null() {
                    self.push_root(st.linfo, d);
                }
                self.push_root(st.name, d);
                self.push_root(st.super_t, d);
                self.push_root(st.parameters as *mut VlValue, d);
                self.push_root(st.names as *mut VlValue, d);
                self.push_root(st.types as *mut VlValue, d);
                if !st.ctor_factory.is_null() {
                    self.push_root(st.ctor_factory, d);
                }
                if !st.instance.is_null() {
                    self.push_root(st.instance, d);
                }
            },
            VlKind::BitsType => unsafe {
                let bt = &*(v as *const VlBitsType);
                debug_assert!(bt.env.is_null());
                debug_assert!(bt.linfo.is_null());
                self.push_root(bt.name, d);
                self.push_root(bt.super_t, d);
                self.push_root(bt.parameters as *mut VlValue, d);
                self.push_root(bt.bnbits, d);
            },
            VlKind::MethTable => unsafe {
                let mt = &*(v as *const VlMethTable);
                self.mark_methlist(mt.defs, d);
                self.mark_methlist(mt.cache, d);
                if !mt.cache_1arg.is_null() {
                    for i in 0..mt.n_1arg {
                        let entry = *mt.cache_1arg.add(i);
                        if !entry.is_null() {
                            self.push_root(entry, d);
                        }
                    }
                }
            },
            VlKind::Task => unsafe {
                let ta = &*(v as *const VlTask);
                self.push_root(ta.on_exit, d);
                self.push_root(ta.start, d);
                self.push_root(ta.result, d);
                self.push_root(ta.eh_task, d);
                // TODO: walk ta.gc_frames with mark_frame_chain and trace
                // ta.output_stream once the scheduler publishes them
            },
            VlKind::Struct => unsafe {
                // plain struct instance: one reference word per field,
                // starting one word into the payload
                let ty = (self.hooks.type_of)(v);
                debug_assert_eq!((self.hooks.kind_of)(ty), VlKind::StructType,
                                 "GC: instance whose type is not a struct type!");
                let st = &*(ty as *const VlStructType);
                let nf = (*st.names).length;
                for i in 0..nf {
                    let fld = *(v as *mut *mut VlValue).add(i + 1);
                    self.push_root(fld, d);
                }
            },
        }
    }

    unsafe fn scan_array(&mut self, v: *mut VlValue, d: i32) {
        let a = &*(v as *const VlArray);
        self.push_root(a.dims, d);
        if !a.data_is_inline() {
            // the out-of-line buffer is its own heap allocation; mark its
            // header directly, it has no kind of its own
            (*as_mut_tagged_value(a.data as *mut VlValue)).set_marked(true);
        }
        let elty = tparam0((self.hooks.type_of)(v));
        if (self.hooks.kind_of)(elty) != VlKind::BitsType {
            let data = a.data as *const *mut VlValue;
            for i in 0..a.length {
                let elt = *data.add(i);
                if !elt.is_null() {
                    self.push_root(elt, d);
                }
            }
        }
    }

    // Method lists hang off method tables outside the value hierarchy:
    // each node's header is marked directly, without kind dispatch.
    unsafe fn mark_methlist(&mut self, mut ml: *mut VlMethList, d: i32) {
        while !ml.is_null() {
            (*as_mut_tagged_value(ml as *mut VlValue)).set_marked(true);
            self.push_root((*ml).sig, d);
            self.push_root((*ml).tvars, d);
            self.push_root((*ml).func, d);
            ml = (*ml).next;
        }
    }

    // Modules are roots rather than ordinary values: mark the module
    // header, then every binding record in its table together with the
    // binding's value (when bound) and its type.
    pub fn mark_module(&mut self, m: *mut VlModule) {
        unsafe {
            (*as_mut_tagged_value(m as *mut VlValue)).set_marked(true);
            let size = (*m).bindings.size;
            let table = (*m).bindings.table;
            let mut i = 1;
            while i < size {
                let entry = *table.add(i);
                if !HTable::is_not_found(entry) {
                    let b = entry as *mut VlBinding;
                    (*as_mut_tagged_value(b as *mut VlValue)).set_marked(true);
                    if !(*b).value.is_null() {
                        self.push_root((*b).value, 0);
                    }
                    self.push_root((*b).ty, 0);
                }
                i += 2;
            }
        }
    }

    // Walk a chain of task root frames, marking every slot. Task scanning
    // does not invoke this yet; see the task arm of scan_value.
    pub fn mark_frame_chain(&mut self, mut s: *mut GcFrame) {
        unsafe {
            while !s.is_null() {
                for i in 0..(*s).nroots {
                    self.push_root(*(*s).roots.add(i), 0);
                }
                s = (*s).prev;
            }
        }
    }

    // Rescan everything queued on the mark stack. Popped values are
    // already marked, so each rescan restarts at depth zero.
    fn visit_mark_stack(&mut self) {
        while let Some(v) = self.mark_stack.pop() {
            self.scan_value(v, 0);
        }
    }
}
