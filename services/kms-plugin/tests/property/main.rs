//! Property tests.

mod envelope;
mod naming;
