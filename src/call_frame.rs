use crate::constants::MAX_HANDLER_FRAMES;
use crate::objects::{object_closure::ObjectClosure, object_function::ObjectFunction};
use crate::value::{make_nil_value, Value};

/// Reserved for a future try/catch extension. No opcode installs handlers
/// yet; `Throw` unwinds every frame unconditionally.
#[derive(Clone, Copy)]
#[allow(dead_code)]
pub struct ExceptionHandler {
    pub handler_address: u16,
    pub finally_address: u16,
    pub class: Value,
}

impl ExceptionHandler {
    fn unset() -> ExceptionHandler {
        ExceptionHandler {
            handler_address: 0,
            finally_address: 0,
            class: make_nil_value(),
        }
    }
}

/// One in-flight call: the closure being executed, an instruction offset into
/// its chunk, and the base of its operand-stack window. Slot zero of the
/// window holds the callee (or the receiver for method calls).
pub struct CallFrame {
    closure: *mut ObjectClosure,
    ip: usize,
    slots_base: usize,
    #[allow(dead_code)]
    handlers: [ExceptionHandler; MAX_HANDLER_FRAMES],
    #[allow(dead_code)]
    handler_count: u8,
}

impl CallFrame {
    pub fn new(closure: *mut ObjectClosure, slots_base: usize) -> Self {
        CallFrame {
            closure,
            ip: 0,
            slots_base,
            handlers: [ExceptionHandler::unset(); MAX_HANDLER_FRAMES],
            handler_count: 0,
        }
    }

    #[inline(always)]
    pub fn closure(&self) -> *mut ObjectClosure {
        self.closure
    }

    #[inline(always)]
    pub fn function(&self) -> *mut ObjectFunction {
        unsafe { (*self.closure).function }
    }

    #[inline(always)]
    pub fn ip(&self) -> usize {
        self.ip
    }

    #[inline(always)]
    pub fn ip_mut(&mut self) -> &mut usize {
        &mut self.ip
    }

    #[inline(always)]
    pub fn slots_base(&self) -> usize {
        self.slots_base
    }
}
