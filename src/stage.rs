//! Drives the advice of one kind as a single future.
//!
//! A `Stage` owns one future per advice of the chain and polls them with the
//! kind's execution policy:
//! - **Parallel**: cooperatively interleaved. An advice is first polled once
//!   every advice it depends on has settled; advice without dependencies
//!   inside the chain start together.
//! - **Sequential**: one by one in chain order, each settling before the next
//!   one is first polled.
//!
//! With `Aggregation::Unit` the first rejection completes the stage and every
//! unsettled advice is dropped, which cancels it and releases its sections.
//! With `Aggregation::All` the stage completes once every advice settled.
use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tracing::trace;

use crate::{
    advice::{AdviceFuture, AdviceKind},
    policy::{Aggregation, Execution, KindPolicy},
    rejection::Rejections,
};

struct Entry<E> {
    aspect: Arc<str>,
    // Chain positions that must settle before this entry is first polled.
    after: Vec<usize>,
    future: Option<AdviceFuture<E>>,
    settled: bool,
}

pub(crate) struct Stage<E> {
    kind: AdviceKind,
    policy: KindPolicy,
    entries: Vec<Entry<E>>,
    cursor: usize,
    rejections: Option<Rejections<E>>,
    done: bool,
}

// Entries are boxed futures; nothing is pinned structurally.
impl<E> Unpin for Stage<E> {}

impl<E> Stage<E> {
    pub(crate) fn new(kind: AdviceKind, policy: KindPolicy) -> Self {
        Self {
            kind,
            policy,
            entries: Vec::with_capacity(8),
            cursor: 0,
            rejections: None,
            done: false,
        }
    }

    pub(crate) fn push(&mut self, aspect: Arc<str>, after: Vec<usize>, future: AdviceFuture<E>) {
        self.entries.push(Entry {
            aspect,
            after,
            future: Some(future),
            settled: false,
        });
    }

    // Records a rejection and reports whether the stage must stop now.
    fn reject(&mut self, index: usize, error: E) -> bool {
        trace!(kind = %self.kind, aspect = %self.entries[index].aspect, "advice rejected");
        match self.rejections.as_mut() {
            Some(rejections) => rejections.push(error),
            None => self.rejections = Some(Rejections::new(error)),
        }
        self.policy.error.aggregation == Aggregation::Unit
    }

    fn cancel_unsettled(&mut self) {
        let mut canceled = 0;
        for entry in self.entries.iter_mut().filter(|e| !e.settled) {
            entry.future = None;
            entry.settled = true;
            canceled += 1;
        }
        if canceled > 0 {
            trace!(kind = %self.kind, canceled, "unsettled advice dropped");
        }
    }

    fn poll_entry(&mut self, index: usize, cx: &mut Context<'_>) -> Poll<Result<(), E>> {
        let entry = &mut self.entries[index];
        let Some(future) = entry.future.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let result = std::task::ready!(future.as_mut().poll(cx));
        entry.future = None;
        entry.settled = true;
        Poll::Ready(result)
    }

    fn poll_sequential(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        while self.cursor < self.entries.len() {
            let index = self.cursor;
            let result = std::task::ready!(self.poll_entry(index, cx));
            self.cursor += 1;
            if let Err(error) = result {
                if self.reject(index, error) {
                    self.cancel_unsettled();
                    return Poll::Ready(());
                }
            }
        }
        Poll::Ready(())
    }

    fn poll_parallel(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        loop {
            let mut progressed = false;
            for index in 0..self.entries.len() {
                let entry = &self.entries[index];
                if entry.settled || !entry.after.iter().all(|&d| self.entries[d].settled) {
                    continue;
                }
                if let Poll::Ready(result) = self.poll_entry(index, cx) {
                    progressed = true;
                    if let Err(error) = result {
                        if self.reject(index, error) {
                            self.cancel_unsettled();
                            return Poll::Ready(());
                        }
                    }
                }
            }
            if self.entries.iter().all(|e| e.settled) {
                return Poll::Ready(());
            }
            // A settled entry may have unblocked dependents that were never
            // polled and so have no waker registered yet.
            if !progressed {
                return Poll::Pending;
            }
        }
    }
}

impl<E> Future for Stage<E> {
    type Output = Result<(), Rejections<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.done {
            let progress = match this.policy.execution {
                Execution::Parallel => this.poll_parallel(cx),
                Execution::Sequential => this.poll_sequential(cx),
            };
            if progress.is_pending() {
                return Poll::Pending;
            }
            this.done = true;
        }
        match this.rejections.take() {
            Some(rejections) => Poll::Ready(Err(rejections)),
            None => Poll::Ready(Ok(())),
        }
    }
}
