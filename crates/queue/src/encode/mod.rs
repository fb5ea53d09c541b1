//! Encoding modules for theora-queue

pub mod driver;

pub use driver::{
    build_encoder_command, EncodeError, EncodeProcess, EncodeResult, RunHandle, RunState,
    FRONTEND_FLAG, OUTPUT_DRAIN_TIMEOUT, STATUS_CANCELLED, STATUS_DONE, STATUS_FAILED,
};
