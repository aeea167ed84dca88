mod test_utils;

mod consolidation_tests;
mod cost_tests;
mod queue_tests;
mod types_tests;
