//! Process-wide engine lifecycle. The engine library can be initialised once
//! and torn down once per process; isolates hold a lease that keeps it alive.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, Level};

use crate::error::{Error, Result};
use crate::events::{SandboxDomain, SandboxEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlatformState {
    Uninitialized,
    Running { live: usize },
    ShutDown,
}

static STATE: Mutex<PlatformState> = Mutex::new(PlatformState::Uninitialized);

fn lock() -> MutexGuard<'static, PlatformState> {
    STATE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Passes command-line style flags (e.g. `--stack-size=512`) to the engine.
/// Only allowed before the engine is initialised.
pub fn set_flags(flags: &str) -> Result<()> {
    let state = lock();
    if *state != PlatformState::Uninitialized {
        return Err(Error::Platform(
            "engine flags must be set before the first isolate is created".into(),
        ));
    }
    v8::V8::set_flags_from_string(flags);
    debug!(flags, "Engine flags set");
    Ok(())
}

/// Initialises the engine. Idempotent; fails once the engine has been shut
/// down, since it cannot be initialised a second time.
pub fn initialize() -> Result<()> {
    let mut state = lock();
    initialize_locked(&mut state)
}

fn initialize_locked(state: &mut PlatformState) -> Result<()> {
    match *state {
        PlatformState::Running { .. } => Ok(()),
        PlatformState::ShutDown => Err(Error::Platform("engine has already been shut down".into())),
        PlatformState::Uninitialized => {
            let platform = v8::new_default_platform(0, false).make_shared();
            v8::V8::initialize_platform(platform);
            v8::V8::initialize();
            *state = PlatformState::Running { live: 0 };
            info!(version = v8::V8::get_version(), "Engine initialised");
            Ok(())
        }
    }
}

pub fn is_initialized() -> bool {
    matches!(*lock(), PlatformState::Running { .. })
}

/// Number of isolates (and snapshot builders) currently holding the engine.
pub fn live_isolates() -> usize {
    match *lock() {
        PlatformState::Running { live } => live,
        _ => 0,
    }
}

/// Tears the engine down for the rest of the process. Refused while any
/// isolate is alive.
pub fn shutdown() -> Result<()> {
    let mut state = lock();
    match *state {
        PlatformState::ShutDown => Ok(()),
        PlatformState::Uninitialized => {
            *state = PlatformState::ShutDown;
            Ok(())
        }
        PlatformState::Running { live } if live > 0 => {
            let message = format!("engine shutdown refused with {} live isolate(s)", live);
            SandboxEvent::new(Level::WARN, SandboxDomain::Platform, "shutdown_refused", &message)
                .emit();
            Err(Error::Platform(message))
        }
        PlatformState::Running { .. } => {
            // SAFETY: no isolate exists and none can be created afterwards,
            // because the state moves to ShutDown under the same lock.
            unsafe {
                v8::V8::dispose();
            }
            v8::V8::dispose_platform();
            *state = PlatformState::ShutDown;
            info!("Engine shut down");
            Ok(())
        }
    }
}

/// Keeps the engine initialised while held.
#[derive(Debug)]
pub(crate) struct PlatformLease {
    _private: (),
}

pub(crate) fn acquire() -> Result<PlatformLease> {
    let mut state = lock();
    initialize_locked(&mut state)?;
    if let PlatformState::Running { live } = &mut *state {
        *live += 1;
    }
    Ok(PlatformLease { _private: () })
}

impl Drop for PlatformLease {
    fn drop(&mut self) {
        if let PlatformState::Running { live } = &mut *lock() {
            *live = live.saturating_sub(1);
        }
    }
}
