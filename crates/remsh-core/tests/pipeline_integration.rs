//! Pipelines mixing registered handlers and external programs.

#![allow(clippy::unwrap_used)]
#![cfg(unix)]

use std::sync::Arc;

use remsh_core::commands::{
    CommandError, CommandHandler, CommandRegistry, HandlerFuture, Invocation, Pipeline, StageIo,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

struct Say;

impl CommandHandler for Say {
    fn call<'a>(&'a self, io: &'a mut StageIo, args: &'a [String]) -> HandlerFuture<'a> {
        Box::pin(async move {
            io.stdout.write_all(args.join(" ").as_bytes()).await?;
            io.stdout.write_all(b"\n").await?;
            Ok(())
        })
    }
}

async fn run(
    registry: CommandRegistry,
    stages: &[Invocation],
    cancel: &CancellationToken,
) -> (Result<(), CommandError>, String) {
    let pipeline = Pipeline::new(Arc::new(registry));
    let (out_w, mut out_r) = tokio::io::duplex(64 * 1024);
    let io = StageIo::new(tokio::io::empty(), out_w, tokio::io::sink());
    let result = pipeline.run(stages, io, cancel).await;
    let mut out = String::new();
    out_r.read_to_string(&mut out).await.unwrap();
    (result, out)
}

#[tokio::test]
async fn echo_into_grep_yields_matching_line() {
    let stages = [
        Invocation::new("echo", ["footest"]),
        Invocation::new("grep", ["test"]),
    ];
    let (result, out) = run(CommandRegistry::new(), &stages, &CancellationToken::new()).await;
    result.unwrap();
    assert_eq!(out, "footest\n");
}

#[tokio::test]
async fn registered_producer_feeds_external_filter() {
    let mut registry = CommandRegistry::new();
    registry.register("say", Say);
    let stages = [
        Invocation::new("say", ["footest"]),
        Invocation::new("grep", ["test"]),
    ];
    let (result, out) = run(registry, &stages, &CancellationToken::new()).await;
    result.unwrap();
    assert_eq!(out, "footest\n");
}

#[tokio::test]
async fn grep_without_match_reports_annotated_failure() {
    let stages = [
        Invocation::new("echo", ["foo"]),
        Invocation::new("grep", ["test"]),
    ];
    let (result, out) = run(CommandRegistry::new(), &stages, &CancellationToken::new()).await;
    let err = result.unwrap_err();
    assert!(out.is_empty());
    assert!(
        err.to_string()
            .starts_with(r#"command ["grep", "test"] at index 1 failed:"#),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn cancelled_pipeline_returns_error() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let stages = [
        Invocation::new("sleep", ["10"]),
        Invocation::new("cat", Vec::<String>::new()),
    ];
    let (result, _) = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        run(CommandRegistry::new(), &stages, &cancel),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(CommandError::Cancelled)));
}
