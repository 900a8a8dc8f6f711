// Copyright 2024 The Lumen Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides pretty printing for quantities with natural units.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::panic)]
#![deny(clippy::wildcard_imports)]
#![forbid(unsafe_code)]
#![deny(unused_crate_dependencies)]

#[cfg(test)]
extern crate alloc;

mod bytes;

pub use bytes::Bytes;
