pub mod rewards;
pub mod utils;
