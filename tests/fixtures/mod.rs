//! Shared test fixtures: scripted agent client and instance scaffolding.

#![allow(dead_code)]

pub mod project;
pub mod scripted_client;

pub use project::TestProject;
pub use scripted_client::{ScriptStep, ScriptedClient};

use parking_lot::{Mutex, MutexGuard};

/// Tests that exercise the per-pid session context run under one lock;
/// parallel tests in the same binary share a pid and would otherwise
/// clobber each other's context file.
pub fn context_guard() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock()
}
