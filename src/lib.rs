// weft — cooperative microthreads and a synchronous bit-banged link
// for single-core MCUs with no OS of their own.
//
// hal:    the seams to the target (clock, pins, IRQ counter, LED)
// kernel: wait primitives and the dispatching scheduler
// link:   the SynCom channel and its wire serializer

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod hal;
pub mod kernel;
pub mod link;
