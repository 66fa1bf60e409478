use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use aspectron::{
    AdviceKind, Aggregation, AroundHooks, Aspect, ContextError, Execution, Halt, KindPolicy,
    Prioritized, Priority, Process, Rejections, RestrictedContext, Sections, Target, advice,
    current_context, exit_invocation,
};

#[derive(Clone, Debug, PartialEq, Eq)]
enum Fault {
    Context(ContextError),
    Target(&'static str),
    Advice(&'static str),
    Retry,
}

impl From<ContextError> for Fault {
    fn from(error: ContextError) -> Self {
        Fault::Context(error)
    }
}

impl Prioritized for Fault {
    fn priority(&self) -> Priority {
        match self {
            Fault::Retry => Priority::HIGH,
            Fault::Context(_) => Priority::LOW,
            _ => Priority::NORMAL,
        }
    }
}

type Log = Arc<Mutex<Vec<&'static str>>>;

fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn recording(log: &Log, entry: &'static str) -> advice::Before<Fault> {
    let log = Arc::clone(log);
    advice::before(move |_| {
        let log = Arc::clone(&log);
        async move {
            log.lock().unwrap().push(entry);
            Ok::<(), Fault>(())
        }
    })
}

fn failing(error: Fault) -> advice::Before<Fault> {
    advice::before(move |_| {
        let error = error.clone();
        async move { Err::<(), Fault>(error) }
    })
}

fn counting(counter: &Arc<AtomicU32>) -> advice::After<Fault> {
    let counter = Arc::clone(counter);
    advice::after(move |_| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), Fault>(())
        }
    })
}

fn map_target(target: Target<u32, Fault>, map: fn(u32) -> u32) -> Target<u32, Fault> {
    Target::new(move || {
        let target = target.clone();
        async move { target.call().await.map(map) }
    })
}

fn wrapping(map: fn(u32) -> u32) -> advice::Around<u32, Fault> {
    advice::around(move |_, hooks: AroundHooks<u32, Fault>| async move {
        hooks.attach_to_target(|target| map_target(target, map));
        Ok::<(), Fault>(())
    })
}

fn delaying(delay: Duration) -> advice::Around<u32, Fault> {
    advice::around(move |_, hooks: AroundHooks<u32, Fault>| async move {
        hooks.attach_to_target(move |target| {
            Target::new(move || {
                let target = target.clone();
                async move {
                    tokio::time::sleep(delay).await;
                    target.call().await
                }
            })
        });
        Ok::<(), Fault>(())
    })
}

// Fails with `Fault::Target` until it has been called `succeed_on` times.
fn flaky(calls: &Arc<AtomicU32>, succeed_on: u32) -> Target<u32, Fault> {
    let calls = Arc::clone(calls);
    Target::new(move || {
        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if call >= succeed_on {
                Ok(7)
            } else {
                Err(Fault::Target("flaky"))
            }
        }
    })
}

fn retrying(limit: u32) -> Aspect<u32, Fault> {
    Aspect::new("retry").after_throwing(
        advice::after_throwing(move |view, error: Fault| async move {
            let attempts = view
                .with_mut("retry", |attempts: &mut u32| {
                    *attempts += 1;
                    *attempts
                })
                .map_err(Fault::from)?;
            if attempts < limit {
                Err::<(), Fault>(Fault::Retry)
            } else {
                Err(error)
            }
        })
        .uses(["retry"]),
    )
}

fn retry_sections() -> Sections {
    Sections::new().with("retry", 0u32)
}

async fn retry_on_signal(halt: Halt<u32, Fault>) -> Result<u32, Fault> {
    if *halt.error() == Fault::Retry {
        halt.retry().await
    } else {
        Err(halt.into_error())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn target_without_aspects() {
    let process = Process::<u32, Fault>::builder().build().unwrap();

    let value = process.run(Sections::new, Target::new(|| async { Ok(3) })).await;
    assert_eq!(value, Ok(3));

    let error = process
        .run(Sections::new, Target::new(|| async { Err(Fault::Target("down")) }))
        .await;
    assert_eq!(error, Err(Fault::Target("down")));
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_signal_reinvokes_chain() {
    let calls = Arc::new(AtomicU32::new(0));
    let afters = Arc::new(AtomicU32::new(0));
    let halted_attempts = Arc::new(Mutex::new(Vec::new()));
    let halted = Arc::clone(&halted_attempts);

    let process = Process::<u32, Fault>::builder()
        .aspect(retrying(3))
        .aspect(Aspect::new("audit").after(counting(&afters)))
        .handle_error(move |halt: Halt<u32, Fault>| {
            halted.lock().unwrap().push(halt.attempt());
            retry_on_signal(halt)
        })
        .build()
        .unwrap();

    let value = process.run(retry_sections, flaky(&calls, 3)).await;

    assert_eq!(value, Ok(7));
    assert_eq!(calls.load(Ordering::SeqCst), 3, "target should run once per attempt");
    assert_eq!(afters.load(Ordering::SeqCst), 3, "after should run once per attempt");
    assert_eq!(*halted_attempts.lock().unwrap(), [1, 2]);
}

#[tokio::test(flavor = "multi_thread")]
async fn delayed_target_retries_until_success() {
    let calls = Arc::new(AtomicU32::new(0));
    let process = Process::<u32, Fault>::builder()
        .aspect(retrying(3).around(delaying(Duration::from_millis(100))))
        .handle_error(retry_on_signal)
        .build()
        .unwrap();
    let context = RestrictedContext::new(retry_sections());

    let started = Instant::now();
    let value = process.run_in(context.clone(), flaky(&calls, 3)).await;

    assert_eq!(value, Ok(7));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(
        started.elapsed() >= Duration::from_millis(300),
        "every attempt should be delayed by the around wrapper"
    );
    let retries = context
        .use_sections(["retry"], |view| async move { view.get::<u32>("retry") })
        .await;
    assert_eq!(retries, Ok(Ok(2)));
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_gives_up_with_target_error() {
    let calls = Arc::new(AtomicU32::new(0));
    let process = Process::<u32, Fault>::builder()
        .aspect(retrying(3))
        .handle_error(retry_on_signal)
        .build()
        .unwrap();

    let error = process.run(retry_sections, flaky(&calls, u32::MAX)).await;

    assert_eq!(error, Err(Fault::Target("flaky")));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn before_advice_follow_dependencies() {
    let log = log();

    // Added in reverse order; `a` is also the slowest so a naive parallel
    // run would finish it last.
    let slow_a = {
        let log = Arc::clone(&log);
        advice::before(move |_| {
            let log = Arc::clone(&log);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                log.lock().unwrap().push("a");
                Ok::<(), Fault>(())
            }
        })
    };
    let process = Process::<u32, Fault>::builder()
        .aspect(Aspect::new("c").before(recording(&log, "c").depends_on(["b"])))
        .aspect(Aspect::new("b").before(recording(&log, "b").depends_on(["a"])))
        .aspect(Aspect::new("a").before(slow_a))
        .build()
        .unwrap();

    assert_eq!(process.order(AdviceKind::Before), ["a", "b", "c"]);

    let value = process.run(Sections::new, Target::new(|| async { Ok(1) })).await;
    assert_eq!(value, Ok(1));
    assert_eq!(*log.lock().unwrap(), ["a", "b", "c"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn independent_parallel_advice_interleave() {
    let log = log();
    let slow = {
        let log = Arc::clone(&log);
        advice::before(move |_| {
            let log = Arc::clone(&log);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                log.lock().unwrap().push("slow");
                Ok::<(), Fault>(())
            }
        })
    };
    let process = Process::<u32, Fault>::builder()
        .aspect(Aspect::new("slow").before(slow))
        .aspect(Aspect::new("fast").before(recording(&log, "fast")))
        .build()
        .unwrap();

    process
        .run(Sections::new, Target::new(|| async { Ok(1) }))
        .await
        .unwrap();
    assert_eq!(*log.lock().unwrap(), ["fast", "slow"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn sequential_before_keeps_chain_order() {
    let log = log();
    let slow = {
        let log = Arc::clone(&log);
        advice::before(move |_| {
            let log = Arc::clone(&log);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                log.lock().unwrap().push("slow");
                Ok::<(), Fault>(())
            }
        })
    };
    let process = Process::<u32, Fault>::builder()
        .aspect(Aspect::new("slow").before(slow))
        .aspect(Aspect::new("fast").before(recording(&log, "fast")))
        .policy(AdviceKind::Before, KindPolicy::default().sequential())
        .build()
        .unwrap();

    process
        .run(Sections::new, Target::new(|| async { Ok(1) }))
        .await
        .unwrap();
    assert_eq!(*log.lock().unwrap(), ["slow", "fast"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn parallel_all_collects_every_rejection() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_by_hook = Arc::clone(&seen);
    let calls = Arc::new(AtomicU32::new(0));

    let process = Process::<u32, Fault>::builder()
        .aspect(Aspect::new("first").before(failing(Fault::Advice("first"))))
        .aspect(Aspect::new("second").before(failing(Fault::Advice("second"))))
        .aggregation(AdviceKind::Before, Aggregation::All)
        .determine_error(move |rejections: Rejections<Fault>| {
            let all = rejections.into_vec();
            seen_by_hook.lock().unwrap().extend(all.iter().cloned());
            all[0].clone()
        })
        .build()
        .unwrap();

    let error = process.run(Sections::new, flaky(&calls, 1)).await;

    assert_eq!(error, Err(Fault::Advice("first")));
    assert_eq!(
        *seen.lock().unwrap(),
        [Fault::Advice("first"), Fault::Advice("second")]
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0, "halted before, target must not run");
}

#[tokio::test(flavor = "multi_thread")]
async fn first_rejection_drops_unsettled_siblings() {
    let finished = Arc::new(AtomicBool::new(false));
    let slow = {
        let finished = Arc::clone(&finished);
        advice::before(move |_| {
            let finished = Arc::clone(&finished);
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                finished.store(true, Ordering::SeqCst);
                Ok::<(), Fault>(())
            }
        })
    };
    let process = Process::<u32, Fault>::builder()
        .aspect(Aspect::new("slow").before(slow))
        .aspect(Aspect::new("broken").before(failing(Fault::Advice("broken"))))
        .build()
        .unwrap();

    let error = process.run(Sections::new, Target::new(|| async { Ok(1) })).await;
    assert_eq!(error, Err(Fault::Advice("broken")));

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(!finished.load(Ordering::SeqCst), "sibling should have been dropped");
}

#[tokio::test(flavor = "multi_thread")]
async fn priority_picks_dominant_error() {
    let process = Process::<u32, Fault>::builder()
        .aspect(Aspect::new("plain").before(failing(Fault::Advice("plain"))))
        .aspect(Aspect::new("signal").before(failing(Fault::Retry)))
        .aggregation(AdviceKind::Before, Aggregation::All)
        .determine_error(Rejections::into_dominant)
        .build()
        .unwrap();

    let error = process.run(Sections::new, Target::new(|| async { Ok(1) })).await;
    assert_eq!(error, Err(Fault::Retry));
}

#[tokio::test(flavor = "multi_thread")]
async fn around_wrappers_compose_in_chain_order() {
    let process = Process::<u32, Fault>::builder()
        .aspect(Aspect::new("increment").around(wrapping(|v| v + 1)))
        .aspect(
            Aspect::new("double").around(wrapping(|v| v * 2).depends_on(["increment"])),
        )
        .build()
        .unwrap();

    let value = process.run(Sections::new, Target::new(|| async { Ok(5) })).await;
    assert_eq!(value, Ok(12));
}

#[tokio::test(flavor = "multi_thread")]
async fn around_ignores_parallel_execution() {
    let log = log();
    let logged = |entry: &'static str, delay: u64, map: fn(u32) -> u32| {
        let log = Arc::clone(&log);
        advice::around(move |_, hooks: AroundHooks<u32, Fault>| {
            let log = Arc::clone(&log);
            async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                log.lock().unwrap().push(entry);
                hooks.attach_to_target(|target| map_target(target, map));
                Ok::<(), Fault>(())
            }
        })
    };

    let process = Process::<u32, Fault>::builder()
        .aspect(Aspect::new("increment").around(logged("increment", 20, |v| v + 1)))
        .aspect(Aspect::new("double").around(logged("double", 0, |v| v * 2)))
        .execution(AdviceKind::Around, Execution::Parallel)
        .build()
        .unwrap();

    let value = process.run(Sections::new, Target::new(|| async { Ok(5) })).await;

    assert_eq!(value, Ok(12));
    assert_eq!(*log.lock().unwrap(), ["increment", "double"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn attached_result_skips_target_and_later_around() {
    let calls = Arc::new(AtomicU32::new(0));
    let returned = Arc::new(AtomicU32::new(0));
    let returned_by_advice = Arc::clone(&returned);

    let process = Process::<u32, Fault>::builder()
        .aspect(Aspect::new("cache").around(advice::around(
            |_, hooks: AroundHooks<u32, Fault>| async move {
                hooks.attach_to_result(99);
                Ok::<(), Fault>(())
            },
        )))
        .aspect(Aspect::new("double").around(wrapping(|v| v * 2)))
        .aspect(Aspect::new("observe").after_returning(advice::after_returning(
            move |_, value: u32| {
                returned_by_advice.store(value, Ordering::SeqCst);
                async { Ok::<(), Fault>(()) }
            },
        )))
        .build()
        .unwrap();

    let value = process.run(Sections::new, flaky(&calls, 1)).await;

    assert_eq!(value, Ok(99));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(returned.load(Ordering::SeqCst), 99);
}

#[tokio::test(flavor = "multi_thread")]
async fn after_throwing_replaces_error() {
    let returning_ran = Arc::new(AtomicBool::new(false));
    let ran = Arc::clone(&returning_ran);
    let afters = Arc::new(AtomicU32::new(0));

    let process = Process::<u32, Fault>::builder()
        .aspect(
            Aspect::new("translate")
                .after_throwing(advice::after_throwing(|_, error: Fault| async move {
                    assert_eq!(error, Fault::Target("boom"));
                    Err::<(), Fault>(Fault::Advice("translated"))
                }))
                .after_returning(advice::after_returning(move |_, _: u32| {
                    ran.store(true, Ordering::SeqCst);
                    async { Ok::<(), Fault>(()) }
                }))
                .after(counting(&afters)),
        )
        .build()
        .unwrap();

    let error = process
        .run(Sections::new, Target::new(|| async { Err(Fault::Target("boom")) }))
        .await;

    assert_eq!(error, Err(Fault::Advice("translated")));
    assert!(!returning_ran.load(Ordering::SeqCst));
    assert_eq!(afters.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn continued_rejections_surface_by_default() {
    let calls = Arc::new(AtomicU32::new(0));
    let process = Process::<u32, Fault>::builder()
        .aspect(Aspect::new("lenient").before(failing(Fault::Advice("lenient"))))
        .policy(AdviceKind::Before, KindPolicy::default().carry_on())
        .build()
        .unwrap();

    let error = process.run(Sections::new, flaky(&calls, 1)).await;

    assert_eq!(error, Err(Fault::Advice("lenient")));
    assert_eq!(calls.load(Ordering::SeqCst), 1, "continue must not skip the target");
}

#[tokio::test(flavor = "multi_thread")]
async fn continuous_resolution_can_keep_value() {
    let carried = Arc::new(AtomicUsize::new(0));
    let carried_by_hook = Arc::clone(&carried);

    let process = Process::<u32, Fault>::builder()
        .aspect(Aspect::new("metrics").after(advice::after(|_| async {
            Err::<(), Fault>(Fault::Advice("metrics"))
        })))
        .resolve_continuous(move |rejections, value| {
            carried_by_hook.store(rejections.len(), Ordering::SeqCst);
            Ok(value)
        })
        .build()
        .unwrap();

    let value = process.run(Sections::new, Target::new(|| async { Ok(4) })).await;

    assert_eq!(value, Ok(4));
    assert_eq!(carried.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn halting_after_fails_successful_attempt() {
    let process = Process::<u32, Fault>::builder()
        .aspect(Aspect::new("strict").after(advice::after(|_| async {
            Err::<(), Fault>(Fault::Advice("strict"))
        })))
        .policy(AdviceKind::After, KindPolicy::default().halt())
        .build()
        .unwrap();

    let error = process.run(Sections::new, Target::new(|| async { Ok(4) })).await;
    assert_eq!(error, Err(Fault::Advice("strict")));
}

#[tokio::test(flavor = "multi_thread")]
async fn advice_sharing_a_section_conflict() {
    let holder = advice::before(|view| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        view.set("x", 1u32).map_err(Fault::from)
    })
    .uses(["x"]);
    let contender = advice::before(|view| async move { view.set("x", 2u32).map_err(Fault::from) })
        .uses(["x"]);

    let process = Process::<u32, Fault>::builder()
        .aspect(Aspect::new("holder").before(holder))
        .aspect(Aspect::new("contender").before(contender))
        .build()
        .unwrap();

    let error = process
        .run(|| Sections::new().with("x", 0u32), Target::new(|| async { Ok(1) }))
        .await;
    assert_eq!(
        error,
        Err(Fault::Context(ContextError::SectionInUse("x".to_string())))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn target_reaches_invocation_context() {
    let process = Process::<u32, Fault>::builder()
        .aspect(
            Aspect::new("seed").before(
                advice::before(|view| async move {
                    view.set("user", 42u32).map_err(Fault::from)
                })
                .uses(["user"]),
            ),
        )
        .build()
        .unwrap();

    let target = Target::<u32, Fault>::new(|| async {
        assert_eq!(
            exit_invocation(current_context).unwrap_err(),
            ContextError::OutsideScope
        );
        let context = current_context()?;
        let user = context
            .use_sections(["user"], |view| async move { view.get::<u32>("user") })
            .await??;
        Ok(user)
    });

    let value = process
        .run(|| Sections::new().with("user", 0u32), target)
        .await;
    assert_eq!(value, Ok(42));
    assert_eq!(current_context().unwrap_err(), ContextError::OutsideScope);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_invocations_are_isolated() {
    let process = Process::<u32, Fault>::builder()
        .aspect(
            Aspect::new("count").before(
                advice::before(|view| async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    view.with_mut("hits", |hits: &mut u32| *hits += 1)
                        .map_err(Fault::from)
                })
                .uses(["hits"]),
            ),
        )
        .build()
        .unwrap();

    let read_hits = || {
        Target::<u32, Fault>::new(|| async {
            let context = current_context()?;
            let hits = context
                .use_sections(["hits"], |view| async move { view.get::<u32>("hits") })
                .await??;
            Ok(hits)
        })
    };

    let (first, second) = tokio::join!(
        process.run(|| Sections::new().with("hits", 10u32), read_hits()),
        process.run(|| Sections::new().with("hits", 20u32), read_hits()),
    );
    assert_eq!(first, Ok(11));
    assert_eq!(second, Ok(21));
}
