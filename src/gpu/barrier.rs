//! Cooperative threadgroup barrier
//!
//! Threads of a threadgroup run as futures on one executor. A thread that
//! reaches the barrier parks until every thread of its group has arrived;
//! the last arrival opens the barrier for the current generation and wakes
//! the rest.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

struct BarrierState {
    parties: usize,
    arrived: usize,
    generation: u64,
    waiters: Vec<Waker>,
}

/// Reusable barrier shared by the threads of one threadgroup.
#[derive(Clone)]
pub struct Barrier {
    state: Rc<RefCell<BarrierState>>,
}

impl Barrier {
    pub fn new(parties: usize) -> Self {
        Self {
            state: Rc::new(RefCell::new(BarrierState {
                parties,
                arrived: 0,
                generation: 0,
                waiters: Vec::new(),
            })),
        }
    }

    /// Arrive at the barrier and wait for the rest of the group.
    pub fn wait(&self) -> BarrierWait {
        BarrierWait {
            state: Rc::clone(&self.state),
            generation: None,
        }
    }

    /// How many times the barrier has opened.
    pub fn generation(&self) -> u64 {
        self.state.borrow().generation
    }
}

/// Future returned by [`Barrier::wait`].
pub struct BarrierWait {
    state: Rc<RefCell<BarrierState>>,
    /// Generation this waiter arrived in; `None` until first polled.
    generation: Option<u64>,
}

impl Future for BarrierWait {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = &mut *self;
        let mut state = this.state.borrow_mut();
        match this.generation {
            Some(generation) if state.generation != generation => Poll::Ready(()),
            Some(_) => {
                if !state.waiters.iter().any(|w| w.will_wake(cx.waker())) {
                    state.waiters.push(cx.waker().clone());
                }
                Poll::Pending
            }
            None => {
                state.arrived += 1;
                if state.arrived >= state.parties {
                    state.arrived = 0;
                    state.generation += 1;
                    let waiters = std::mem::take(&mut state.waiters);
                    drop(state);
                    for waiter in waiters {
                        waiter.wake();
                    }
                    Poll::Ready(())
                } else {
                    this.generation = Some(state.generation);
                    state.waiters.push(cx.waker().clone());
                    Poll::Pending
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::future::join_all;

    #[test]
    fn test_single_party_never_blocks() {
        let barrier = Barrier::new(1);
        block_on(async {
            barrier.wait().await;
            barrier.wait().await;
        });
        assert_eq!(barrier.generation(), 2);
    }

    #[test]
    fn test_no_thread_passes_before_all_arrive() {
        let barrier = Barrier::new(4);
        let events = Rc::new(RefCell::new(Vec::new()));
        let threads = (0..4).map(|id| {
            let barrier = barrier.clone();
            let events = Rc::clone(&events);
            async move {
                events.borrow_mut().push(("before", id));
                barrier.wait().await;
                events.borrow_mut().push(("after", id));
                barrier.wait().await;
            }
        });
        block_on(join_all(threads));

        let events = events.borrow();
        let first_after = events.iter().position(|(phase, _)| *phase == "after").unwrap();
        assert_eq!(first_after, 4);
        assert_eq!(events.len(), 8);
        assert_eq!(barrier.generation(), 2);
    }
}
