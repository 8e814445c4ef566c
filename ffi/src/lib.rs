//! C FFI of the bufferqueue crate.
//!
//! This crate provides a C API allowing a producer and a consumer written in
//! C to share a buffer queue. Buffers are backed by memfd files, so their
//! file descriptors can be passed to other processes.

pub mod queue;

static INIT: std::sync::Once = std::sync::Once::new();

/// Initialize the bufferqueue library. This only sets up the proper hooks for
/// logging, so although it is not a hard requirement to call this function,
/// failure to do so will result in no logs being printed.
#[no_mangle]
pub extern "C" fn bufq_init() {
    INIT.call_once(|| {
        #[cfg(feature = "env_logger")]
        env_logger::builder().format_timestamp(None).init();

        #[cfg(feature = "android")]
        android_logger::init_once(
            android_logger::Config::default().with_min_level(log::Level::Trace),
        );
    });
}
