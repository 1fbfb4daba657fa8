// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A single-assignment completion cell.
//!
//! [`completion_pair`] returns a [`Completer`], which resolves the cell exactly
//! once, and a [`Completion`], which any number of clones can poll, block on, or
//! `.await`. Worker threads (pipeline compilation, upload submission) publish
//! their results through it and the render thread never has to block unless it
//! explicitly asks to.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// The completer was dropped without resolving the cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canceled;

impl fmt::Display for Canceled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "completion was dropped before it resolved")
    }
}

impl std::error::Error for Canceled {}

enum Slot<T> {
    Pending,
    Ready(T),
    Canceled,
}

struct CellState<T> {
    slot: Slot<T>,
    wakers: Vec<Waker>,
}

struct Cell<T> {
    state: Mutex<CellState<T>>,
    resolved: Condvar,
}

impl<T> Cell<T> {
    fn lock(&self) -> MutexGuard<'_, CellState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, slot: Slot<T>) {
        let wakers = {
            let mut state = self.lock();
            if !matches!(state.slot, Slot::Pending) {
                return;
            }
            state.slot = slot;
            std::mem::take(&mut state.wakers)
        };
        self.resolved.notify_all();
        for waker in wakers {
            waker.wake();
        }
    }
}

/// Creates a linked completer / completion pair.
pub fn completion_pair<T: Clone>() -> (Completer<T>, Completion<T>) {
    let cell = Arc::new(Cell {
        state: Mutex::new(CellState {
            slot: Slot::Pending,
            wakers: Vec::new(),
        }),
        resolved: Condvar::new(),
    });
    (
        Completer {
            cell: Some(cell.clone()),
        },
        Completion { cell },
    )
}

/// The writing half of a completion cell.
///
/// Dropping it without calling [`Completer::complete`] cancels the cell.
pub struct Completer<T> {
    cell: Option<Arc<Cell<T>>>,
}

impl<T> Completer<T> {
    /// Resolves the cell with `value` and wakes every waiter.
    pub fn complete(mut self, value: T) {
        if let Some(cell) = self.cell.take() {
            cell.settle(Slot::Ready(value));
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            cell.settle(Slot::Canceled);
        }
    }
}

impl<T> fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer").finish_non_exhaustive()
    }
}

/// The reading half of a completion cell. Cheap to clone.
pub struct Completion<T> {
    cell: Arc<Cell<T>>,
}

impl<T: Clone> Completion<T> {
    /// A completion that is already resolved.
    pub fn resolved(value: T) -> Self {
        let (completer, completion) = completion_pair();
        completer.complete(value);
        completion
    }

    /// Returns the value if the cell has resolved, without blocking.
    pub fn poll(&self) -> Option<Result<T, Canceled>> {
        match &self.cell.lock().slot {
            Slot::Pending => None,
            Slot::Ready(value) => Some(Ok(value.clone())),
            Slot::Canceled => Some(Err(Canceled)),
        }
    }

    /// Returns `true` once the cell has resolved or been canceled.
    pub fn is_complete(&self) -> bool {
        !matches!(self.cell.lock().slot, Slot::Pending)
    }

    /// Blocks the calling thread until the cell resolves.
    pub fn wait(&self) -> Result<T, Canceled> {
        let mut state = self.cell.lock();
        loop {
            match &state.slot {
                Slot::Ready(value) => return Ok(value.clone()),
                Slot::Canceled => return Err(Canceled),
                Slot::Pending => {
                    state = self
                        .cell
                        .resolved
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Blocks until the cell resolves or `timeout` elapses.
    ///
    /// Returns `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, Canceled>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.cell.lock();
        loop {
            match &state.slot {
                Slot::Ready(value) => return Some(Ok(value.clone())),
                Slot::Canceled => return Some(Err(Canceled)),
                Slot::Pending => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, _) = self
                        .cell
                        .resolved
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                }
            }
        }
    }
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.cell.lock().slot {
            Slot::Pending => "pending",
            Slot::Ready(_) => "ready",
            Slot::Canceled => "canceled",
        };
        f.debug_struct("Completion").field("state", &state).finish()
    }
}

impl<T: Clone> Future for Completion<T> {
    type Output = Result<T, Canceled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.cell.lock();
        match &state.slot {
            Slot::Ready(value) => Poll::Ready(Ok(value.clone())),
            Slot::Canceled => Poll::Ready(Err(Canceled)),
            Slot::Pending => {
                if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    state.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}
