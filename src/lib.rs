//! Physical memory management for the Windy kernel.
//!
//! The [`mem`] module contains the buddy allocator that hands out
//! naturally aligned, power-of-two sized chunks of physical pages.
#![deny(rust_2018_idioms, rustdoc::broken_intra_doc_links)]
#![allow(clippy::missing_safety_doc)]
#![cfg_attr(not(test), no_std)]

#[cfg(not(any(target_pointer_width = "64", target_pointer_width = "32")))]
compile_error!("Windy can only run on 32 or 64 bit systems");

pub mod mem;
pub mod unit;
