mod ringbuffer;

pub use ringbuffer::*;
