// Event names dashboard clients listen for.

// client → server control
pub const SET_INTERVAL: &str = "set-interval";
pub const REQUEST_SNAPSHOT: &str = "request-snapshot";
pub const PING: &str = "ping";

// server → client replies
pub const INTERVAL_SET: &str = "interval-set";
pub const PONG: &str = "pong";
pub const ERROR: &str = "error";
pub const HEARTBEAT: &str = "heartbeat";

// rejection text expected by clients on a bad cadence request
pub const INVALID_INTERVAL_MESSAGE: &str = "Invalid interval";
