//! Page mapping, metadata vectors and allocation for the runtime
pub mod cache;
pub mod code;
pub mod mapper;
pub mod nursery;
pub mod pcb;
pub mod segments;
pub mod stack;
