// This file is part of Argus, a motion-triggered camera recording pipeline.
// Copyright (C) 2025 The Argus Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Tools for propagating a graceful shutdown signal through the program.
//!
//! The receiver can be cloned, then polled cheaply from loop threads
//! (`check`), blocked on with a bound (`wait_for`), or awaited from async
//! code (`future`). Dropping the single sender requests shutdown.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use crate::{Condvar, Mutex};
use futures::Future;
use slab::Slab;

#[derive(Debug)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownError {}

impl From<ShutdownError> for crate::Error {
    fn from(e: ShutdownError) -> Self {
        crate::Error::wrap(crate::ErrorKind::Cancelled, e)
    }
}

struct State {
    down: bool,
    wakers: Slab<Waker>,
}

struct Inner {
    state: Mutex<State>,
    condvar: Condvar,
}

pub struct Sender(Arc<Inner>);

impl Drop for Sender {
    fn drop(&mut self) {
        // Flip the flag before waking anyone so a woken waiter always
        // observes the shutdown.
        let mut state = self.0.state.lock();
        state.down = true;
        for (_, w) in state.wakers.iter() {
            w.wake_by_ref();
        }
        state.wakers.clear();
        drop(state);
        self.0.condvar.notify_all();
    }
}

#[derive(Clone)]
pub struct Receiver(Arc<Inner>);

/// `waker_i` value indicating no slab slot has been assigned yet.
const NO_WAKER: usize = usize::MAX;

impl Receiver {
    /// Returns `Err(ShutdownError)` iff shutdown has been requested.
    pub fn check(&self) -> Result<(), ShutdownError> {
        if self.0.state.lock().down {
            Err(ShutdownError)
        } else {
            Ok(())
        }
    }

    /// Blocks for up to `timeout`. `Ok` means the timeout elapsed with no
    /// shutdown; `Err` means shutdown was requested. Loop threads use this
    /// as their tick, so they exit within one tick of the request.
    pub fn wait_for(&self, timeout: Duration) -> Result<(), ShutdownError> {
        let l = self.0.state.lock();
        let (_guard, result) = self
            .0
            .condvar
            .wait_timeout_while(l, timeout, |state| !state.down);
        if result.timed_out() {
            Ok(())
        } else {
            Err(ShutdownError)
        }
    }

    /// Returns a future that resolves when shutdown is requested.
    pub fn future(&self) -> ReceiverFuture {
        ReceiverFuture {
            inner: self.0.clone(),
            waker_i: NO_WAKER,
        }
    }
}

pub struct ReceiverFuture {
    inner: Arc<Inner>,
    waker_i: usize,
}

impl Future for ReceiverFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = Pin::into_inner(self);
        let mut state = this.inner.state.lock();
        if state.down {
            return Poll::Ready(());
        }
        let new_waker = cx.waker();
        if this.waker_i == NO_WAKER {
            this.waker_i = state.wakers.insert(new_waker.clone());
        } else {
            let existing = &mut state.wakers[this.waker_i];
            if !new_waker.will_wake(existing) {
                existing.clone_from(new_waker);
            }
        }
        Poll::Pending
    }
}

impl Drop for ReceiverFuture {
    fn drop(&mut self) {
        if self.waker_i == NO_WAKER {
            return;
        }
        let mut state = self.inner.state.lock();
        if state.wakers.contains(self.waker_i) {
            state.wakers.remove(self.waker_i);
        }
    }
}

/// Returns a sender and receiver for graceful shutdown.
///
/// Dropping the sender requests shutdown.
pub fn channel() -> (Sender, Receiver) {
    let inner = Arc::new(Inner {
        state: Mutex::new(State {
            down: false,
            wakers: Slab::new(),
        }),
        condvar: Condvar::new(),
    });
    (Sender(inner.clone()), Receiver(inner))
}
