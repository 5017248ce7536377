// session
pub const DEFAULT_STREAM_COUNT: usize = 8;
pub const MAX_STREAM_COUNT: usize = 49;

// downscale policy: sources at or above 1280x720 are capped to 640x480
pub const DOWNSCALE_MIN_WIDTH: usize = 1280;
pub const DOWNSCALE_MIN_HEIGHT: usize = 720;
pub const DOWNSCALE_WIDTH: usize = 640;
pub const DOWNSCALE_HEIGHT: usize = 480;

// delivery
pub const DEFAULT_FRAME_DEPTH: usize = 1;
// share of published frames replaced before the consumer read them
pub const DROP_ALERT_PERCENT: f64 = 50.0;

// connections
pub const OPEN_TIMEOUT_MS: u64 = 10_000;
pub const READ_TIMEOUT_MS: u64 = 10_000;
pub const OPEN_RETRIES: u32 = 2;
pub const OPEN_BACKOFF_MS: u64 = 500;
pub const MAX_OPEN_BACKOFF_MS: u64 = 8_000;

// limits
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;
pub const MAX_CONVERT_FAILS: u32 = 10;
pub const STOP_JOIN_TIMEOUT_MS: u64 = 2_000;

pub const STREAM_THREAD_PREFIX: &str = "camgrid-stream";
