mod executor_tests;
mod util;
