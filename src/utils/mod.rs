pub mod http;
pub mod net;
pub mod sse;
pub mod task;

#[doc(hidden)]
pub mod test_support;
