use crate::{
    call_frame::CallFrame,
    objects::{
        object::{Object, ObjectType},
        object_manager::ObjectManager,
        object_string::ObjectString,
        object_upvalue::ObjectUpvalue,
    },
    table::Table,
    value::{as_object, is_object, Value},
};

/// Precise stop-the-world mark-sweep. Marking flips the header bit and feeds
/// a gray worklist; the worklist itself is plain storage, never GC-managed,
/// so collection cannot recurse into itself.
pub struct GarbageCollector {
    gray_stack: Vec<*mut Object>,
    stats: GCStats,
}

/// Aggregated GC statistics (does not include currently-live total bytes;
/// the object manager tracks that).
#[derive(Default, Debug, Clone)]
pub struct GCStats {
    pub cycles: u64,
    pub total_freed_bytes: usize,
    pub last_freed_bytes: usize,
    pub last_before_bytes: usize,
    pub last_after_bytes: usize,
    pub last_next_trigger_bytes: usize,
}

impl GCStats {
    fn record(&mut self, before: usize, freed: usize, after: usize, next_trigger: usize) {
        self.cycles += 1;
        self.total_freed_bytes += freed;
        self.last_freed_bytes = freed;
        self.last_before_bytes = before;
        self.last_after_bytes = after;
        self.last_next_trigger_bytes = next_trigger;
    }
}

// Lightweight tracing macro (only active with the gc_debug feature).
#[cfg(feature = "gc_debug")]
macro_rules! gc_trace { ($($arg:tt)*) => { eprintln!("[gc-trace] {}", format_args!($($arg)*)); } }
#[cfg(not(feature = "gc_debug"))]
macro_rules! gc_trace { ($($arg:tt)*) => {}; }
pub(crate) use gc_trace;

impl GarbageCollector {
    pub fn new() -> Self {
        Self {
            gray_stack: Vec::new(),
            stats: GCStats::default(),
        }
    }

    /// Mark a single object and queue it for tracing.
    pub fn mark_object(&mut self, object: *mut Object) {
        if object.is_null() {
            return;
        }
        unsafe {
            if (*object).is_marked {
                return;
            }
            (*object).is_marked = true;
        }
        gc_trace!("mark ptr={:p}", object);
        self.gray_stack.push(object);
    }

    /// Mark a value (if it references the heap).
    pub fn mark_value(&mut self, value: &Value) {
        if is_object(value) {
            self.mark_object(as_object(value));
        }
    }

    /// Mark every key and value of a table.
    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key as *mut Object);
            self.mark_value(value);
        }
    }

    /// Phase 1: the root set is the live stack window, every frame's closure,
    /// every open upvalue, the globals table, and the interned `init` name.
    /// The intern set is deliberately not a root; it is swept weakly.
    pub fn mark_roots(
        &mut self,
        stack: &[Value],
        frames: &[CallFrame],
        open_upvalues: &[*mut ObjectUpvalue],
        globals: &Table,
        init_string: *mut ObjectString,
    ) {
        for value in stack {
            self.mark_value(value);
        }

        for frame in frames {
            self.mark_object(frame.closure() as *mut Object);
        }

        for &upvalue in open_upvalues {
            self.mark_object(upvalue as *mut Object);
        }

        self.mark_table(globals);
        self.mark_object(init_string as *mut Object);
    }

    /// Phase 2: drain the gray worklist, blackening one object at a time.
    pub fn trace_references(&mut self) {
        while let Some(object) = self.gray_stack.pop() {
            gc_trace!("blacken ptr={:p}", object);
            unsafe {
                self.blacken_object(object);
            }
        }
    }

    /// Mark all references out of an object.
    unsafe fn blacken_object(&mut self, object: *mut Object) {
        match (*object).obj_type {
            ObjectType::ObjClosure => {
                let closure = (*object).as_closure();
                self.mark_object(closure.function as *mut Object);
                for &upvalue in &closure.upvalues {
                    self.mark_object(upvalue as *mut Object);
                }
            }
            ObjectType::ObjFunction => {
                let function = (*object).as_function();
                for constant in function.chunk.iter_constants() {
                    self.mark_value(constant);
                }
            }
            ObjectType::ObjUpvalue => {
                // Harmless while open: the location aims at a stack slot,
                // which is a root anyway.
                let upvalue = (*object).as_upvalue();
                self.mark_value(&*upvalue.location);
            }
            ObjectType::ObjClass => {
                let class = (*object).as_class();
                self.mark_table(&class.methods);
            }
            ObjectType::ObjInstance => {
                let instance = (*object).as_instance();
                self.mark_object(instance.class as *mut Object);
                self.mark_table(&instance.fields);
            }
            ObjectType::ObjBoundMethod => {
                let bound = (*object).as_bound_method();
                self.mark_value(&bound.receiver);
                self.mark_object(bound.method as *mut Object);
            }
            ObjectType::ObjString | ObjectType::ObjNativeFunction => {}
        }
    }

    /// Phase 4: free the white objects, reset survivor marks.
    pub fn sweep(&mut self, object_manager: &mut ObjectManager) -> usize {
        let freed = object_manager.sweep_unmarked();
        gc_trace!("sweep freed_bytes={}", freed);
        freed
    }

    /// Record a completed cycle (the VM knows bytes before/after and the new
    /// trigger threshold).
    pub fn record_cycle(&mut self, before: usize, freed: usize, after: usize, next_trigger: usize) {
        self.stats.record(before, freed, after, next_trigger);
        gc_trace!(
            "cycle summary cycles={} freed={} before={} after={} next_trigger={}",
            self.stats.cycles,
            freed,
            before,
            after,
            next_trigger
        );
    }

    pub fn stats(&self) -> &GCStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{make_nil_value, make_object_value, Value};

    fn collect(
        gc: &mut GarbageCollector,
        manager: &mut ObjectManager,
        stack: &[Value],
        frames: &[CallFrame],
        open_upvalues: &[*mut ObjectUpvalue],
        globals: &Table,
        intern_strings: &mut Table,
    ) -> usize {
        gc.mark_roots(stack, frames, open_upvalues, globals, std::ptr::null_mut());
        gc.trace_references();
        intern_strings.remove_white();
        gc.sweep(manager)
    }

    #[test]
    fn test_collects_unreachable_objects() {
        let mut manager = ObjectManager::new();
        let (keep, _) = manager.alloc_string("keep");
        let (_drop1, _) = manager.alloc_string("drop1");
        let (_drop2, _) = manager.alloc_string("drop2");

        let mut gc = GarbageCollector::new();
        let stack = [make_object_value(keep as *mut Object)];
        let globals = Table::new();
        let mut intern_strings = Table::new();

        let freed = collect(&mut gc, &mut manager, &stack, &[], &[], &globals, &mut intern_strings);
        assert!(freed > 0, "expected some bytes to be freed");
        assert_eq!(manager.object_count(), 1, "only the rooted object should remain");
    }

    #[test]
    fn test_preserves_reachable_closure_and_function() {
        let mut manager = ObjectManager::new();
        let (function, _) = manager.alloc_function(0, "f1".to_string());
        let (closure, _) = manager.alloc_closure(function);
        let (_unreachable, _) = manager.alloc_function(0, "f2".to_string());

        let mut gc = GarbageCollector::new();
        let stack = [make_object_value(closure as *mut Object)];
        let globals = Table::new();
        let mut intern_strings = Table::new();

        collect(&mut gc, &mut manager, &stack, &[], &[], &globals, &mut intern_strings);
        assert_eq!(manager.object_count(), 2, "closure and its function should remain");
    }

    #[test]
    fn test_marks_through_open_upvalue() {
        let mut manager = ObjectManager::new();
        let (string, _) = manager.alloc_string("captured");
        let mut stack = [make_object_value(string as *mut Object), make_nil_value()];
        let (upvalue, _) = manager.alloc_upvalue(&mut stack[0] as *mut Value);

        let mut gc = GarbageCollector::new();
        let globals = Table::new();
        let mut intern_strings = Table::new();
        let open_upvalues = [upvalue];

        // Stack window is empty: reachability flows only through the upvalue.
        collect(&mut gc, &mut manager, &[], &[], &open_upvalues, &globals, &mut intern_strings);
        assert_eq!(manager.object_count(), 2, "upvalue and captured string should remain");
    }

    #[test]
    fn test_marks_class_instance_graph() {
        let mut manager = ObjectManager::new();
        let (method_name, _) = manager.alloc_string("method");
        let (function, _) = manager.alloc_function(0, "method".to_string());
        let (closure, _) = manager.alloc_closure(function);
        let (class, _) = manager.alloc_class("Thing".to_string());
        unsafe {
            (*class).methods.set(method_name, make_object_value(closure as *mut Object));
        }
        let (instance, _) = manager.alloc_instance(class);
        let (bound, _) = manager.alloc_bound_method(
            make_object_value(instance as *mut Object),
            closure,
        );

        let mut gc = GarbageCollector::new();
        let stack = [make_object_value(bound as *mut Object)];
        let globals = Table::new();
        let mut intern_strings = Table::new();

        let freed = collect(&mut gc, &mut manager, &stack, &[], &[], &globals, &mut intern_strings);
        // Everything hangs off the bound method; nothing may be freed.
        assert_eq!(freed, 0);
        assert_eq!(manager.object_count(), 6);
    }

    #[test]
    fn test_intern_set_does_not_resurrect_dead_strings() {
        let mut manager = ObjectManager::new();
        let (live, _) = manager.alloc_string("live");
        let (dead, _) = manager.alloc_string("dead");

        let mut gc = GarbageCollector::new();
        let stack = [make_object_value(live as *mut Object)];
        let globals = Table::new();
        let mut intern_strings = Table::new();
        intern_strings.set(live, make_nil_value());
        intern_strings.set(dead, make_nil_value());

        collect(&mut gc, &mut manager, &stack, &[], &[], &globals, &mut intern_strings);
        assert_eq!(manager.object_count(), 1);
        assert_eq!(intern_strings.len(), 1);
        assert!(intern_strings
            .find_string("dead", crate::objects::object_string::hash_string("dead"))
            .is_none());
    }

    #[test]
    fn test_collection_is_idempotent() {
        let mut manager = ObjectManager::new();
        let (keep, _) = manager.alloc_string("keep");
        let (_garbage, _) = manager.alloc_string("garbage");

        let mut gc = GarbageCollector::new();
        let stack = [make_object_value(keep as *mut Object)];
        let globals = Table::new();
        let mut intern_strings = Table::new();

        collect(&mut gc, &mut manager, &stack, &[], &[], &globals, &mut intern_strings);
        let objects_after_first = manager.object_count();
        let bytes_after_first = manager.bytes_allocated();

        let freed = collect(&mut gc, &mut manager, &stack, &[], &[], &globals, &mut intern_strings);
        assert_eq!(freed, 0);
        assert_eq!(manager.object_count(), objects_after_first);
        assert_eq!(manager.bytes_allocated(), bytes_after_first);
    }

    #[test]
    fn test_marks_are_cleared_after_sweep() {
        let mut manager = ObjectManager::new();
        let (keep, _) = manager.alloc_string("keep");

        let mut gc = GarbageCollector::new();
        let stack = [make_object_value(keep as *mut Object)];
        let globals = Table::new();
        let mut intern_strings = Table::new();

        collect(&mut gc, &mut manager, &stack, &[], &[], &globals, &mut intern_strings);
        for &object in manager.iter() {
            assert!(!unsafe { (*object).is_marked });
        }
    }

    #[test]
    fn test_stats_record_cycle() {
        let mut gc = GarbageCollector::new();
        assert_eq!(gc.stats().cycles, 0);
        gc.record_cycle(1000, 400, 600, 1200);
        assert_eq!(gc.stats().cycles, 1);
        assert_eq!(gc.stats().last_before_bytes, 1000);
        assert_eq!(gc.stats().last_freed_bytes, 400);
        assert_eq!(gc.stats().last_after_bytes, 600);
        assert_eq!(gc.stats().last_next_trigger_bytes, 1200);
        assert_eq!(gc.stats().total_freed_bytes, 400);
    }
}
