//! Concurrent invokes against one emulator: completions correlate to
//! their submitters and never overlap in the hosted runtime.

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use nimbus_emulator::LocalRuntime;
use support::{Greeted, Greeting, OverlapProbe, greeter};

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_invokes_each_get_their_own_completion() {
    let runtime = Arc::new(LocalRuntime::builder().handler(greeter()).build().unwrap());

    let mut tasks = Vec::new();
    for n in 0..10 {
        let runtime = Arc::clone(&runtime);
        tasks.push(tokio::spawn(async move {
            let result = runtime
                .invoke::<Greeting, Greeted>(&Greeting {
                    name: format!("caller-{n}"),
                })
                .await
                .unwrap();
            (n, result)
        }));
    }

    for task in tasks {
        let (n, result) = task.await.unwrap();
        assert!(result.is_success(), "caller-{n} failed: {:?}", result.error);
        assert_eq!(
            result.response.unwrap().message,
            format!("Hello caller-{n}!")
        );
    }

    runtime.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn at_most_one_invocation_is_in_flight_at_a_time() {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let runtime = Arc::new(
        LocalRuntime::builder()
            .middleware(Arc::new(OverlapProbe {
                current: Arc::clone(&current),
                peak: Arc::clone(&peak),
            }))
            .handler(greeter())
            .build()
            .unwrap(),
    );

    let mut tasks = Vec::new();
    for n in 0..8 {
        let runtime = Arc::clone(&runtime);
        tasks.push(tokio::spawn(async move {
            runtime
                .invoke::<Greeting, Greeted>(&Greeting {
                    name: format!("caller-{n}"),
                })
                .await
                .unwrap()
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_success());
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    runtime.stop().await.unwrap();
}
