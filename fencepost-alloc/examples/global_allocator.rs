//
// ••• fencepost-alloc: a boundary-tag dynamic memory allocator
// --- and the fencepost-alloc contributors
//
//  Copyright (c) 2024 the fencepost-alloc contributors
//  Released under the terms of the MIT license. See `LICENSE` in the root
//  directory of this repository for more information.
//
//! Installing `FencepostAlloc` as the process-wide allocator and
//! printing its exit-time statistics.
//!
//! Run with `MALLOCVERBOSE=NO cargo run --example global_allocator -p
//! fencepost-alloc` to suppress the report.

use fencepost_alloc::FencepostAlloc;

#[global_allocator]
static ALLOCATOR: FencepostAlloc = FencepostAlloc::new();

fn main() {
    ALLOCATOR.install_exit_report();

    let mut v: Vec<u32> = Vec::with_capacity(1024);
    v.extend(0..1024);
    let sum: u32 = v.iter().sum();
    println!("sum of 0..1024 = {sum}");
    drop(v);

    let s = String::from("allocated through the boundary-tag heap");
    println!("{s}");
}
