pub const UINT8_COUNT: usize = u8::MAX as usize + 1;

pub const FRAMES_MAX: usize = 64;
pub const MAX_STACK_SIZE: usize = FRAMES_MAX * UINT8_COUNT;
pub const MAX_HANDLER_FRAMES: usize = 16;

pub const TABLE_MAX_LOAD: f64 = 0.75;

pub const GC_HEAP_GROW_FACTOR: usize = 2;
pub const GC_INITIAL_THRESHOLD: usize = 1024 * 1024;
