use crate::objects::object::{Object, ObjectType};
use crate::value::{make_nil_value, Value};

/// While open, `location` points at a live operand-stack slot. Closing copies
/// the slot into `closed` and retargets `location` at it.
#[repr(C)]
pub struct ObjectUpvalue {
    pub object: Object,
    pub location: *mut Value,
    pub closed: Value,
}

impl ObjectUpvalue {
    pub fn new(location: *mut Value) -> Self {
        ObjectUpvalue {
            object: Object::new(ObjectType::ObjUpvalue),
            location,
            closed: make_nil_value(),
        }
    }

    pub fn is_open(&self) -> bool {
        !std::ptr::eq(self.location, &self.closed)
    }
}
