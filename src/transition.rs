//! Stepped transitions
//!
//! A transition is an asynchronous state machine driven by a [`StepRunner`]:
//! `next_step` decides where to go from the current step (it must be a pure
//! function of the step and the runner's progress counters) and
//! `execute_step` starts the work for a step.  When that work is done,
//! whoever finishes it calls [`Transition::advance`] (or
//! [`Transition::return_error`]) and the machine moves on.
//!
//! ## Flat stack
//! `advance` may be called from inside `execute_step` when a step completes
//! synchronously.  Such nested calls only record the request; the outermost
//! `advance` keeps looping.  The stack never grows with the number of steps
//! and `advance` never runs twice at once on the same transition.
//!
//! ## Errors and rollback
//! `return_error` completes the transition with the first error it is given.
//! Hooks registered with [`Transition::on_rollback`] then run once, in
//! registration order, before the completion callback.
//!
//! ## Cancellation
//! Each transition carries a [`Cancellable`].  [`Transition::cancel`] fails
//! the transition with [`Error::Cancelled`]; async operations that resolve
//! afterwards find it completed and are ignored.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::error::{Error, Result};

pub type Step = u32;

pub const STEP_NONE: Step = 0;
pub const STEP_ERROR: Step = 1;
pub const STEP_CUSTOM_START: Step = 0x10;

pub trait StepRunner {
    /// Step that follows `step`. Returning `step` itself means "still waiting".
    fn next_step(&self, transition: &Transition, step: Step) -> Step;

    /// Start the work of `step`. Never called with `STEP_NONE` or `STEP_ERROR`.
    fn execute_step(&self, transition: &Transition, step: Step);
}

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct Cancellable(Rc<Cell<bool>>);

impl Cancellable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.get()
    }
}

type CompletionFn = Box<dyn FnOnce(Result<()>)>;
type RollbackFn = Box<dyn FnOnce()>;

#[derive(Default)]
struct State {
    step: Step,
    started: bool,
    completed: bool,
    error: Option<Error>,
    advancing: bool,
    advance_requested: bool,
}

struct Inner {
    name: String,
    runner: Rc<dyn StepRunner>,
    state: RefCell<State>,
    callback: RefCell<Option<CompletionFn>>,
    rollback: RefCell<Vec<RollbackFn>>,
    cancellable: Cancellable,
}

#[derive(Clone)]
pub struct Transition {
    inner: Rc<Inner>,
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.borrow();
        f.debug_struct("Transition")
            .field("name", &self.inner.name)
            .field("step", &st.step)
            .field("completed", &st.completed)
            .field("error", &st.error)
            .finish()
    }
}

impl Transition {
    pub fn new(
        name: impl Into<String>,
        runner: Rc<dyn StepRunner>,
        callback: impl FnOnce(Result<()>) + 'static,
    ) -> Self {
        Self {
            inner: Rc::new(Inner {
                name: name.into(),
                runner,
                state: RefCell::new(State::default()),
                callback: RefCell::new(Some(Box::new(callback))),
                rollback: RefCell::new(Vec::new()),
                cancellable: Cancellable::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn step(&self) -> Step {
        self.inner.state.borrow().step
    }

    pub fn completed(&self) -> bool {
        self.inner.state.borrow().completed
    }

    pub fn had_error(&self) -> bool {
        self.inner.state.borrow().error.is_some()
    }

    pub fn error(&self) -> Option<Error> {
        self.inner.state.borrow().error.clone()
    }

    pub fn cancellable(&self) -> Cancellable {
        self.inner.cancellable.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellable.is_cancelled()
    }

    pub fn ptr_eq(&self, other: &Transition) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Undo side effects if the transition ends up failing.
    pub fn on_rollback(&self, hook: impl FnOnce() + 'static) {
        if self.completed() {
            return;
        }
        self.inner.rollback.borrow_mut().push(Box::new(hook));
    }

    /// Move the state machine forward as far as it goes without waiting.
    pub fn advance(&self) -> Result<()> {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.completed {
                log::warn!("{}: advance on a completed transition", self.inner.name);
                return Err(Error::AlreadyCompleted);
            }
            if st.advancing {
                st.advance_requested = true;
                return Ok(());
            }
            st.advancing = true;
            st.started = true;
        }

        loop {
            if self.inner.cancellable.is_cancelled() {
                self.return_error(Error::Cancelled);
                break;
            }

            let step = self.step();
            let next = self.inner.runner.next_step(self, step);

            if next == STEP_ERROR {
                let err = self
                    .error()
                    .unwrap_or_else(|| Error::invariant(format!("{}: state machine error", self.inner.name)));
                self.return_error(err);
                break;
            }

            if next == STEP_NONE {
                self.complete_ok();
                break;
            }

            if next != step {
                log::trace!("{}: step {:#x} -> {:#x}", self.inner.name, step, next);
                self.inner.state.borrow_mut().step = next;
                self.inner.runner.execute_step(self, next);
            }

            let mut st = self.inner.state.borrow_mut();
            if st.completed || !st.advance_requested {
                break;
            }
            st.advance_requested = false;
        }

        let mut st = self.inner.state.borrow_mut();
        st.advancing = false;
        st.advance_requested = false;
        Ok(())
    }

    /// Fail the transition. Only the first error is kept.
    pub fn return_error(&self, err: Error) {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.completed {
                if st.error.is_none() {
                    log::warn!("{}: error after completion: {}", self.inner.name, err);
                }
                return;
            }
            if let Some(prev) = &st.error {
                log::warn!(
                    "{}: bailing out multiple times; old error: {}, new error: {}",
                    self.inner.name,
                    prev,
                    err
                );
                return;
            }
            st.error = Some(err.clone());
            st.step = STEP_ERROR;
            st.completed = true;
        }

        log::debug!("{}: failed: {}", self.inner.name, err);

        let hooks = std::mem::take(&mut *self.inner.rollback.borrow_mut());
        for hook in hooks {
            hook();
        }
        self.invoke_callback(Err(err));
    }

    /// Fail with [`Error::Cancelled`] and mark the token.
    pub fn cancel(&self) {
        self.inner.cancellable.cancel();
        self.return_error(Error::Cancelled);
    }

    /// Outcome of a completed transition.
    pub fn finish(&self) -> Result<()> {
        let st = self.inner.state.borrow();
        if let Some(err) = &st.error {
            return Err(err.clone());
        }
        if !st.started {
            return Err(Error::invariant(format!(
                "{}: finished before starting",
                self.inner.name
            )));
        }
        if !st.completed {
            return Err(Error::invariant(format!("{}: not completed", self.inner.name)));
        }
        Ok(())
    }

    fn complete_ok(&self) {
        {
            let mut st = self.inner.state.borrow_mut();
            st.step = STEP_NONE;
            st.completed = true;
        }
        self.inner.rollback.borrow_mut().clear();
        self.invoke_callback(Ok(()));
    }

    fn invoke_callback(&self, result: Result<()>) {
        let callback = self.inner.callback.borrow_mut().take();
        match callback {
            Some(cb) => cb(result),
            None => log::warn!("{}: completed more than once", self.inner.name),
        }
    }
}
