mod reading_sessions;
pub mod utils;
