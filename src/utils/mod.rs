pub mod logging;
pub mod utils_time;
