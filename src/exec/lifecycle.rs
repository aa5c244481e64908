//! Process lifecycle and the shim context.
//!
//! The lifecycle is a strict sequence of phases:
//! 1. Unhooked: nothing intercepted yet (constructors may already allocate)
//! 2. Hooking: real entry points captured, region reserved, real entry resolved
//! 3. PreMain: stdio flushed, sentinel written, stdin primed, restricted mode on
//! 4. Running: the program's `main`
//! 5. Finalizing: exit handlers LIFO, then real fini and rtld_fini once each
//! 6. Terminated: only the exit system call is left
//!
//! Finalizing can be entered from any earlier phase and re-entered from
//! inside itself (a handler calling `exit`). Every other transition is
//! rejected.
//!
//! # Borrowing discipline
//!
//! `ShimContext` keeps heap and lifecycle state in separate `RefCell`s. A
//! borrow is only ever held for a short, self-contained step: no callback,
//! log statement or diagnostic write happens while one is live. A nested
//! entry that still finds a borrow held gets `ShimError::Reentrant` instead
//! of aliasing.
//!
//! The context is single-threaded by contract: the sandboxed program cannot
//! create threads under restricted mode, and nothing before `main` does.

use crate::config::settings::{HeapSizeSource, ShimConfig};
use crate::config::types::{Result, ShimError};
use crate::exec::finalizers::{Finalizer, FinalizerRegistry};
use crate::heap::Heap;
use crate::kernel::stdio::SENTINEL;
use crate::kernel::symbols::{FiniFn, InitFn, MainFn, StartMainFn};
use crate::kernel::Host;
use log::{debug, info, warn};
use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::ptr::NonNull;

/// Lifecycle phase
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Unhooked,
    Hooking,
    PreMain,
    Running,
    Finalizing,
    Terminated,
}

impl Phase {
    /// Whether `self -> to` is a legal transition.
    pub fn can_advance(self, to: Phase) -> bool {
        use Phase::*;
        match (self, to) {
            (Terminated, _) => false,
            (_, Finalizing) => true,
            (Unhooked, Hooking) | (Hooking, PreMain) | (PreMain, Running) => true,
            (Finalizing, Terminated) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Unhooked => "unhooked",
            Phase::Hooking => "hooking",
            Phase::PreMain => "pre-main",
            Phase::Running => "running",
            Phase::Finalizing => "finalizing",
            Phase::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// The program's real entry points as handed to `__libc_start_main`.
#[derive(Clone, Copy, Debug)]
pub struct EntryPoints {
    pub main: MainFn,
    pub init: Option<InitFn>,
    pub fini: Option<FiniFn>,
    pub rtld_fini: Option<FiniFn>,
}

#[derive(Debug)]
struct LifecycleState {
    entry: Option<EntryPoints>,
    ran_fini: bool,
    ran_rtld_fini: bool,
    finalizers: FinalizerRegistry,
}

/// Everything the shim owns for one process.
pub struct ShimContext<H> {
    host: H,
    config: Cell<Option<ShimConfig>>,
    phase: Cell<Phase>,
    restricted: Cell<bool>,
    heap: RefCell<Option<Heap>>,
    state: RefCell<LifecycleState>,
}

// SAFETY: the shim runs on a single thread (see module docs); the context is
// only shared so it can sit in a `static`.
unsafe impl<H: Sync> Sync for ShimContext<H> {}

impl<H: Host> ShimContext<H> {
    /// Context whose configuration is read from the environment on first use.
    pub const fn new(host: H) -> Self {
        Self {
            host,
            config: Cell::new(None),
            phase: Cell::new(Phase::Unhooked),
            restricted: Cell::new(false),
            heap: RefCell::new(None),
            state: RefCell::new(LifecycleState {
                entry: None,
                ran_fini: false,
                ran_rtld_fini: false,
                finalizers: FinalizerRegistry::new(),
            }),
        }
    }

    pub fn with_config(host: H, config: ShimConfig) -> Self {
        let context = Self::new(host);
        context.config.set(Some(config));
        context
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn config(&self) -> ShimConfig {
        match self.config.get() {
            Some(config) => config,
            None => {
                let config = ShimConfig::from_env();
                self.config.set(Some(config));
                config
            }
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase.get()
    }

    /// Whether restricted mode has been installed. Once it has, the only
    /// way out of the process is `SYS_exit`.
    pub fn is_restricted(&self) -> bool {
        self.restricted.get()
    }

    fn advance(&self, to: Phase) -> Result<Phase> {
        let from = self.phase.get();
        if !from.can_advance(to) {
            return Err(ShimError::Phase { from, to });
        }
        self.phase.set(to);
        Ok(from)
    }

    // Heap

    /// Run `f` on the heap, reserving the region on first use.
    pub fn with_heap<R>(&self, f: impl FnOnce(&mut Heap) -> R) -> Result<R> {
        let mut slot = self.heap.try_borrow_mut().map_err(|_| ShimError::Reentrant)?;
        let heap = match &mut *slot {
            Some(heap) => heap,
            empty => empty.insert(Heap::with_capacity(self.config().heap_size)?),
        };
        Ok(f(heap))
    }

    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        self.with_heap(|heap| heap.allocate(size))?
    }

    pub fn allocate_zeroed(&self, count: usize, size: usize) -> Result<NonNull<u8>> {
        self.with_heap(|heap| heap.allocate_zeroed(count, size))?
    }

    pub fn allocate_aligned(&self, align: usize, size: usize) -> Result<NonNull<u8>> {
        self.with_heap(|heap| heap.allocate_aligned(align, size))?
    }

    /// Release `ptr`. A rejected pointer produces one diagnostic line and
    /// leaves the heap untouched.
    pub fn free(&self, ptr: *mut u8) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let outcome = self.with_heap(|heap| heap.free(ptr))?;
        self.report(outcome)
    }

    pub fn resize(&self, ptr: *mut u8, new_size: usize) -> Result<Option<NonNull<u8>>> {
        let outcome = self.with_heap(|heap| heap.resize(ptr, new_size))?;
        self.report(outcome)
    }

    pub fn usable_size(&self, ptr: *mut u8) -> Result<usize> {
        self.with_heap(|heap| heap.usable_size(ptr))?
    }

    /// Program-break emulation over the arena cursor.
    pub fn break_by(&self, increment: isize) -> Result<NonNull<u8>> {
        self.with_heap(|heap| heap.arena_mut().break_by(increment))?
    }

    fn report<T>(&self, outcome: Result<T>) -> Result<T> {
        if let Err(ShimError::InvalidFree { addr }) = &outcome {
            self.host.report_invalid_free(*addr);
        }
        outcome
    }

    // Lifecycle

    /// Hooking: capture the program's entry points, reserve the region and
    /// resolve the real process-entry function.
    pub fn hook(&self, entry: EntryPoints) -> Result<StartMainFn> {
        self.advance(Phase::Hooking)?;
        crate::observability::logging::init_shim_logging();

        let config = self.config();
        match config.source {
            HeapSizeSource::Fallback => warn!(
                "Ignoring malformed heap size, using default of {} bytes",
                config.heap_size
            ),
            source => debug!("Heap size {} bytes ({:?})", config.heap_size, source),
        }

        self.state
            .try_borrow_mut()
            .map_err(|_| ShimError::Reentrant)?
            .entry = Some(entry);

        self.with_heap(|_| ())?;
        let start_main = self.host.resolve_start_main()?;
        info!("Process entry hooked, heap of {} bytes reserved", config.heap_size);
        Ok(start_main)
    }

    /// PreMain: flush, announce, prime stdin and enter restricted mode.
    /// Returns the real init callback for the caller to invoke.
    pub fn pre_main(&self) -> Result<Option<InitFn>> {
        self.advance(Phase::PreMain)?;
        self.host.flush_stdio();
        self.host.announce(SENTINEL);
        if let Err(err) = self.host.prime_stdin() {
            warn!("Skipping stdin peek: {}", err);
        }
        self.host.install_restricted_mode()?;
        self.restricted.set(true);
        Ok(self.entry()?.and_then(|entry| entry.init))
    }

    /// True when the loader never called the init slot, so pre-main has to
    /// run at the top of `main` instead.
    pub fn pre_main_pending(&self) -> bool {
        self.phase() == Phase::Hooking
    }

    /// Running: hand out the real `main`.
    pub fn enter_main(&self) -> Result<MainFn> {
        self.advance(Phase::Running)?;
        match self.entry()? {
            Some(entry) => Ok(entry.main),
            None => Err(ShimError::Phase {
                from: Phase::Unhooked,
                to: Phase::Running,
            }),
        }
    }

    fn entry(&self) -> Result<Option<EntryPoints>> {
        Ok(self
            .state
            .try_borrow()
            .map_err(|_| ShimError::Reentrant)?
            .entry)
    }

    /// Append a plain exit handler.
    pub fn register_at_exit(&self, callback: Option<unsafe extern "C" fn()>) -> Result<()> {
        let callback = callback.ok_or(ShimError::NullCallback)?;
        self.register(Finalizer::Plain(callback))
    }

    /// Append an exit handler taking an argument.
    pub fn register_at_exit_with_arg(
        &self,
        callback: Option<unsafe extern "C" fn(*mut c_void)>,
        arg: *mut c_void,
    ) -> Result<()> {
        let callback = callback.ok_or(ShimError::NullCallback)?;
        self.register(Finalizer::WithArg { callback, arg })
    }

    fn register(&self, finalizer: Finalizer) -> Result<()> {
        self.state
            .try_borrow_mut()
            .map_err(|_| ShimError::Reentrant)?
            .finalizers
            .push(finalizer)
    }

    pub fn registered_finalizers(&self) -> usize {
        self.state.try_borrow().map_or(0, |state| state.finalizers.len())
    }

    /// Run the real fini callback unless it already ran.
    pub fn run_fini(&self) {
        let fini = self.take_once(|state| {
            if state.ran_fini {
                return None;
            }
            state.ran_fini = true;
            state.entry.and_then(|entry| entry.fini)
        });
        if let Some(fini) = fini {
            self.host.flush_stdio();
            // SAFETY: the loader-supplied callback, invoked at most once.
            unsafe { fini() };
        }
    }

    /// Run the real rtld_fini callback unless it already ran.
    pub fn run_rtld_fini(&self) {
        let rtld_fini = self.take_once(|state| {
            if state.ran_rtld_fini {
                return None;
            }
            state.ran_rtld_fini = true;
            state.entry.and_then(|entry| entry.rtld_fini)
        });
        if let Some(rtld_fini) = rtld_fini {
            self.host.flush_stdio();
            // SAFETY: the loader-supplied callback, invoked at most once.
            unsafe { rtld_fini() };
        }
    }

    fn take_once(&self, f: impl FnOnce(&mut LifecycleState) -> Option<FiniFn>) -> Option<FiniFn> {
        self.state.try_borrow_mut().ok().and_then(|mut state| f(&mut state))
    }

    /// Finalizing: drain handlers newest first, run the real finalizers once
    /// and flush. Safe to call again from inside a handler; whatever is left
    /// is then finished by the inner call.
    pub fn shutdown(&self) -> Result<()> {
        self.advance(Phase::Finalizing)?;
        while let Some(finalizer) = self.pop_finalizer() {
            // SAFETY: registered by the program; the slot is already consumed.
            unsafe { finalizer.invoke() };
        }
        self.run_fini();
        self.run_rtld_fini();
        self.host.flush_stdio();
        Ok(())
    }

    fn pop_finalizer(&self) -> Option<Finalizer> {
        self.state.try_borrow_mut().ok()?.finalizers.pop()
    }

    /// Terminated: after this only the exit system call may happen.
    pub fn finish(&self) -> Result<()> {
        self.advance(Phase::Terminated).map(|_| ())
    }
}
