//! Shared test helpers for integration tests
#![allow(dead_code)]

use futures::executor::LocalPool;
use kernel_playground::dom::Element;
use kernel_playground::registry::{TestFailure, TestRegistry};
use kernel_playground::Playground;
use std::cell::Cell;
use std::rc::Rc;
use std::task::Poll;

/// Widget markup bound to `test_id`.
pub fn widget(test_id: &str) -> Element {
    Element::new("div")
        .with_class("Playground")
        .with_attribute("data-test", test_id)
        .with_child(Element::new("h2").with_text(test_id))
        .with_child(
            Element::new("button")
                .with_class("Playground-Run")
                .with_text("Run"),
        )
        .with_child(Element::new("div").with_class("Playground-Log"))
}

/// Registry with `echo` (prints "hello"), `boom` (fails with "kaboom") and
/// `quiet` (fails without a message).
pub fn basic_registry() -> Rc<TestRegistry> {
    let registry = Rc::new(TestRegistry::new());
    registry.register("echo", |playground| async move {
        playground.print("hello");
        Ok(())
    });
    registry.register("boom", |_| async { Err(TestFailure::new("kaboom")) });
    registry.register("quiet", |_| async { Err(TestFailure::silent()) });
    registry
}

/// Register `test_id` as a procedure that counts its invocations and
/// yields once before succeeding.
pub fn register_counting(registry: &TestRegistry, test_id: &str) -> Rc<Cell<u32>> {
    let calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&calls);
    registry.register(test_id, move |_| {
        counter.set(counter.get() + 1);
        async {
            yield_now().await;
            Ok(())
        }
    });
    calls
}

/// Suspend once, scheduling the current task to be polled again.
pub async fn yield_now() {
    let mut yielded = false;
    futures::future::poll_fn(move |cx| {
        if yielded {
            Poll::Ready(())
        } else {
            yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    })
    .await
}

/// A controller for `test_id` whose setup has already completed.
pub fn ready_playground(pool: &mut LocalPool, registry: Rc<TestRegistry>, test_id: &str) -> Playground {
    let playground = Playground::new(widget(test_id), registry, pool.spawner())
        .expect("widget is well formed");
    pool.run_until_stalled();
    playground
}
