//! ffmpeg-backed `Transcoder`.
//!
//! Both steps run ffmpeg as a child process; the executor trait in `cmd` is
//! the seam the tests mock.

pub mod cmd;
mod transcoder;

pub use cmd::{FfmpegExecutor, RealFfmpegExecutor};
pub use transcoder::{concat_args, concat_list, trim_scale_args, FfmpegTranscoder};
