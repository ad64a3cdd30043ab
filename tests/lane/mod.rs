//! Lane round tests
#![allow(unused)]

mod cases;
mod environment;

pub use environment::*;
