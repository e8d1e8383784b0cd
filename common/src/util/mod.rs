pub mod date_util;
pub mod retry;
