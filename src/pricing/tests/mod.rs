//! Property-based tests for the pricing pipeline.

mod proptest_pricing;
