//! Integration tests for the scheduler and the write queue.

mod parallel_execution;
mod write_queue;
