//! organseg - multi-organ segmentation inference pipeline for CT and MR volumes

pub mod core;
pub mod fusion;
pub mod geometry;
pub mod hub;
pub mod io;
pub mod patch;
pub mod runner;
pub mod task;
pub mod volume;
