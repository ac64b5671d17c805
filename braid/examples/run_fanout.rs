//! Run fan-out example.
//!
//! A two-stage task streams simulated model deltas into one stitched output.
//! The submitter reads it live, a second reader joins halfway through, and
//! the worker persists every chunk to storage.
//!
//! Run with:
//! ```bash
//! RUST_LOG=debug BRAID_STORAGE_DIR=/tmp/braid cargo run --example run_fanout
//! ```

use braid::prelude::*;
use futures::{stream, StreamExt};
use std::io::{self, Write};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn deltas(text: &'static str, delay: Duration) -> impl futures::Stream<Item = StreamResult<String>> {
    stream::iter(text.split_inclusive(' ')).then(move |word| async move {
        tokio::time::sleep(delay).await;
        Ok(word.to_string())
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let worker = RunWorker::<String>::from_config(RunnerConfig::from_env()?);
    let handle = worker.spawn();

    let task = task_fn("plan-then-answer", |ctx: RunContext<String>| async move {
        ctx.merge(deltas("[plan] look up the facts, then answer. ", Duration::from_millis(40)))?;
        ctx.merge(deltas("The answer is forty-two.", Duration::from_millis(40)))?;
        Ok(())
    });

    let submission = worker.submit(task).await?;
    println!("Run {} submitted\n", submission.run_id);

    let mut live = submission.stream;
    let mut late = None;
    let mut seen = 0;

    while let Some(chunk) = live.next().await {
        print!("{}", chunk?);
        io::stdout().flush()?;
        seen += 1;
        if seen == 4 {
            late = Some(worker.subscribe(&submission.run_id)?);
        }
    }
    println!("\n");

    if let Some(late) = late {
        let text: Vec<String> = late.filter_map(|c| async move { c.ok() }).collect().await;
        println!("Late reader saw: {}\n", text.concat());
    }

    // The record is saved once the output reader has drained the output.
    let run = loop {
        match worker.status(&submission.run_id).await? {
            Some(run) if run.is_finished() => break run,
            _ => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    };
    let stored = worker.store().load_chunks(&run.id).await?;
    println!("Status: {} ({} chunks stored)", run.status, stored.len());

    handle.shutdown().await;
    Ok(())
}
