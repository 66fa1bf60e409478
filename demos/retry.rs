use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use aspectron::{
    Aspect, ContextError, Halt, Prioritized, Priority, Process, Rejections, Sections, Target,
    advice,
};
use tokio::time::sleep;

#[derive(Clone, Debug)]
enum Failure {
    Context(ContextError),
    Unavailable(u32),
    // Raised by the retry aspect to ask for another attempt.
    Retry { after: Duration },
}

impl From<ContextError> for Failure {
    fn from(error: ContextError) -> Self {
        Failure::Context(error)
    }
}

impl Prioritized for Failure {
    fn priority(&self) -> Priority {
        match self {
            Failure::Retry { .. } => Priority::HIGH,
            _ => Priority::NORMAL,
        }
    }
}

const MAX_ATTEMPTS: u32 = 4;

fn retry_aspect() -> Aspect<String, Failure> {
    Aspect::new("retry").after_throwing(
        advice::after_throwing(|view, error: Failure| async move {
            let attempts = view.with_mut("attempts", |attempts: &mut u32| {
                *attempts += 1;
                *attempts
            })?;
            if attempts >= MAX_ATTEMPTS {
                println!("Giving up after {attempts} attempts");
                return Err(error);
            }
            let after = Duration::from_millis(50 * 2u64.pow(attempts - 1));
            println!("Attempt {attempts} failed with {error:?}, retrying in {after:?}");
            Err::<(), Failure>(Failure::Retry { after })
        })
        .uses(["attempts"]),
    )
}

fn logging_aspect() -> Aspect<String, Failure> {
    Aspect::new("logging")
        .before(advice::before(|_| async {
            println!("Calling service");
            Ok(())
        }))
        .after_returning(advice::after_returning(|_, body: String| async move {
            println!("Service answered: {body}");
            Ok(())
        }))
}

async fn backoff(halt: Halt<String, Failure>) -> Result<String, Failure> {
    if let Failure::Retry { after } = *halt.error() {
        sleep(after).await;
        halt.retry().await
    } else {
        Err(halt.into_error())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let process = Process::builder()
        .aspect(retry_aspect())
        .aspect(logging_aspect())
        .determine_error(Rejections::into_dominant)
        .handle_error(backoff)
        .build()
        .expect("aspects are valid");

    // Unavailable for the first two calls.
    let calls = Arc::new(AtomicU32::new(0));
    let service = Target::new(move || {
        let call = calls.fetch_add(1, Ordering::Relaxed) + 1;
        async move {
            if call < 3 {
                Err(Failure::Unavailable(call))
            } else {
                Ok(format!("hello from call {call}"))
            }
        }
    });

    let result = process
        .run(|| Sections::new().with("attempts", 0u32), service)
        .await;
    println!("Result: {result:?}");

    // Never recovers.
    let down = Target::new(|| async { Err::<String, _>(Failure::Unavailable(0)) });
    let result = process
        .run(|| Sections::new().with("attempts", 0u32), down)
        .await;
    println!("Result: {result:?}");
}
