mod quiz_sessions;

pub use quiz_sessions::*;
