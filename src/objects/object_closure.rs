use crate::objects::{
    object::{Object, ObjectType},
    object_function::ObjectFunction,
    object_upvalue::ObjectUpvalue,
};

/// Runtime pairing of a function with its captured upvalues. The upvalue
/// array length always equals the function's declared upvalue count; slots
/// are filled right after allocation while the closure sits on the stack.
#[repr(C)]
pub struct ObjectClosure {
    pub object: Object,
    pub function: *mut ObjectFunction,
    pub upvalues: Vec<*mut ObjectUpvalue>,
}

impl ObjectClosure {
    pub fn new(function: *mut ObjectFunction, upvalue_count: usize) -> Self {
        ObjectClosure {
            object: Object::new(ObjectType::ObjClosure),
            function,
            upvalues: vec![std::ptr::null_mut(); upvalue_count],
        }
    }
}
