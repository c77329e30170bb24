//! Property-oriented tests for frame encoding and chunk parsing.

mod chunks;
mod requests;
mod shared;
