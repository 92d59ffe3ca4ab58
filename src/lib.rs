pub mod diff;
pub mod dp;
pub mod error;
pub mod hmm;
pub mod mocks;
pub mod prob;
pub mod seq;
pub mod train;

extern crate jemallocator;
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[macro_use]
extern crate approx;
