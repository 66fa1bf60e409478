use std::time::Duration;

use aspectron::{AroundHooks, Aspect, ContextError, Process, Sections, Target, advice};
use tokio::time::{sleep, timeout};

#[derive(Clone, Debug)]
enum Failure {
    Context(ContextError),
    TimedOut(Duration),
}

impl From<ContextError> for Failure {
    fn from(error: ContextError) -> Self {
        Failure::Context(error)
    }
}

// Races every call of the wrapped target against the limit stored in the
// `timeout` section.
fn timeout_aspect() -> Aspect<&'static str, Failure> {
    Aspect::new("timeout").around(
        advice::around(|view, hooks: AroundHooks<&'static str, Failure>| async move {
            let limit: Duration = view.get("timeout")?;
            hooks.attach_to_target(move |target| {
                Target::new(move || {
                    let call = target.call();
                    async move {
                        timeout(limit, call)
                            .await
                            .unwrap_or(Err(Failure::TimedOut(limit)))
                    }
                })
            });
            Ok::<(), Failure>(())
        })
        .uses(["timeout"]),
    )
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let process = Process::builder()
        .aspect(timeout_aspect())
        .build()
        .expect("aspects are valid");

    let sections = || Sections::new().with("timeout", Duration::from_secs(1));

    let quick = Target::new(|| async {
        sleep(Duration::from_millis(200)).await;
        Ok("quick")
    });
    // Has enough time to complete.
    println!("{:?}", process.run(sections, quick).await);

    let slow = Target::new(|| async {
        sleep(Duration::from_secs(3)).await;
        Ok("slow")
    });
    // Does not have enough time, will time out.
    println!("{:?}", process.run(sections, slow).await);
}
