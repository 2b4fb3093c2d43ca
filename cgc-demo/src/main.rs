use std::env;
use std::hint::black_box;
use std::mem::size_of;

use cgc::{Collector, Flags, GcConfig};

/// Number of children each tree node holds.
const FANOUT: usize = 2;

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.len() > 2 {
        eprintln!("Usage: cgc-demo [count] [size]");
        return;
    }

    let count = match args.first().map(|a| a.parse::<usize>()).unwrap_or(Ok(100_000)) {
        Ok(count) => count,
        Err(err) => {
            eprintln!("Error: invalid count: {err}");
            return;
        },
    };
    let size = match args.get(1).map(|a| a.parse::<usize>()).unwrap_or(Ok(64)) {
        Ok(size) => size,
        Err(err) => {
            eprintln!("Error: invalid size: {err}");
            return;
        },
    };

    let config = match GcConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err}");
            return;
        },
    };

    let bottom = 0usize;
    let mut gc = match Collector::with_config(&bottom as *const usize as *const u8, config) {
        Ok(gc) => gc,
        Err(err) => {
            eprintln!("Error: {err}");
            return;
        },
    };

    if let Err(err) = churn(&mut gc, count, size) {
        eprintln!("Error: {err}");
    }

    if let Err(err) = grow_and_drop_tree(&mut gc, 12) {
        eprintln!("Error: {err}");
        return;
    }
    clobber_stack();
    gc.run();

    match serde_json::to_string_pretty(&gc.stats()) {
        Ok(json) => println!("{json}"),
        Err(err) => eprintln!("Error: {err}"),
    }

    gc.stop();
}

/// Allocates `count` short-lived blocks, leaving them to the collector.
#[inline(never)]
fn churn(gc: &mut Collector, count: usize, size: usize) -> Result<(), cgc::GcError> {
    for _ in 0..count {
        let block = gc.allocate(size)?;
        black_box(block);
    }
    log::info!("{count} blocks of {size} bytes allocated, {} still tracked", gc.len());
    Ok(())
}

/// Builds a complete binary tree under a root allocation, then clears the
/// root flag. Only the tree's own links refer to it once this returns, so the
/// next cycle reclaims all of it.
#[inline(never)]
fn grow_and_drop_tree(gc: &mut Collector, depth: usize) -> Result<(), cgc::GcError> {
    let root = gc.allocate_zeroed_with(FANOUT, size_of::<usize>(), Flags::ROOT, None)?;
    let mut level = vec![root];

    for _ in 0..depth {
        let mut next = Vec::with_capacity(level.len() * FANOUT);
        for &parent in &level {
            for child in 0..FANOUT {
                let node = gc.allocate_zeroed(FANOUT, size_of::<usize>())?;
                unsafe { parent.as_ptr().cast::<usize>().add(child).write(node.as_ptr() as usize) };
                next.push(node);
            }
        }
        level = next;
    }

    log::info!("tree of {} allocations built", gc.len());
    gc.set_flags(root.as_ptr(), Flags::empty());
    Ok(())
}

/// Overwrites the stack below the caller so stale words from finished
/// helpers are not picked up by the next scan.
#[inline(never)]
fn clobber_stack() {
    let mut junk = [0usize; 4096];
    black_box(&mut junk);
}
