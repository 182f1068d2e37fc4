mod common;
mod gc_tests;
mod launch_tests;
mod workflow_tests;
