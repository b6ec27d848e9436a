mod api;
mod quiz;
pub mod utils;

pub use utils::test_utils;
