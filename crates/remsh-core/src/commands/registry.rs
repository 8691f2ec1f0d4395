//! Command registry.
//!
//! Maps command names to handlers. A registered command may declare
//! dependencies which run before it; within a single top-level
//! [`CommandRegistry::invoke`] each distinct invocation runs at most once.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{CommandError, CommandHandler, HandlerFuture, Invocation, StageIo};

struct Registered {
    handler: Arc<dyn CommandHandler>,
    deps: Vec<Invocation>,
}

/// Registry of locally dispatched commands.
#[derive(Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Registered>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, handler: impl CommandHandler + 'static) {
        self.register_with_deps(name, handler, Vec::new());
    }

    /// Register a handler whose `deps` must succeed before it runs.
    pub fn register_with_deps(
        &mut self,
        name: impl Into<String>,
        handler: impl CommandHandler + 'static,
        deps: Vec<Invocation>,
    ) {
        self.commands.insert(
            name.into(),
            Registered {
                handler: Arc::new(handler),
                deps,
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Registered command names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run `name` with `args`.
    ///
    /// Registered commands run their dependencies first, then the handler.
    /// Any other name is started as an external program found on `PATH`, with
    /// its standard streams bridged to `io`.
    pub async fn invoke(
        &self,
        name: &str,
        args: &[String],
        io: &mut StageIo,
    ) -> Result<(), CommandError> {
        let mut called = HashSet::new();
        self.invoke_with(Invocation::new(name, args.iter().cloned()), io, &mut called)
            .await
    }

    fn invoke_with<'a>(
        &'a self,
        invocation: Invocation,
        io: &'a mut StageIo,
        called: &'a mut HashSet<Invocation>,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let Some(registered) = self.commands.get(&invocation.name) else {
                return run_external(&invocation.name, &invocation.args, io).await;
            };

            for dep in &registered.deps {
                if called.contains(dep) {
                    continue;
                }
                self.invoke_with(dep.clone(), io, called)
                    .await
                    .map_err(|e| CommandError::Dependency {
                        name: invocation.name.clone(),
                        source: Box::new(e),
                    })?;
            }

            if called.contains(&invocation) {
                debug!(command = %invocation.name, "Already ran in this invocation, skipping");
                return Ok(());
            }

            debug!(command = %invocation.name, args = ?invocation.args, "Running registered command");
            registered.handler.call(io, &invocation.args).await?;
            called.insert(invocation);
            Ok(())
        })
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.names())
            .finish()
    }
}

/// Run an external program with its stdio bridged to `io`.
///
/// Input forwarding stops once the program exits, so a program that ignores
/// its stdin never waits on an endless upstream.
async fn run_external(name: &str, args: &[String], io: &mut StageIo) -> Result<(), CommandError> {
    let mut child = Command::new(name)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CommandError::NotFound(name.to_string()),
            _ => CommandError::Io(e),
        })?;

    let child_stdin = child.stdin.take();
    let mut child_stdout = child
        .stdout
        .take()
        .ok_or_else(|| CommandError::Failed(format!("{name}: stdout not captured")))?;
    let mut child_stderr = child
        .stderr
        .take()
        .ok_or_else(|| CommandError::Failed(format!("{name}: stderr not captured")))?;

    let StageIo {
        stdin,
        stdout,
        stderr,
    } = io;

    let feed = async move {
        let Some(mut sink) = child_stdin else {
            return Ok(0);
        };
        let copied = tokio::io::copy(stdin, &mut sink).await;
        // The program sees end of input once its stdin is shut down.
        let _ = sink.shutdown().await;
        copied
    };

    let drain = async {
        let (out, err) = tokio::join!(
            tokio::io::copy(&mut child_stdout, &mut *stdout),
            tokio::io::copy(&mut child_stderr, &mut *stderr),
        );
        out?;
        err?;
        stdout.flush().await?;
        let status = child.wait().await?;
        Ok::<_, std::io::Error>(status)
    };

    tokio::pin!(feed);
    tokio::pin!(drain);
    let mut feeding = true;
    let status = loop {
        tokio::select! {
            res = &mut drain => break res?,
            res = &mut feed, if feeding => {
                feeding = false;
                if let Err(e) = res
                    && e.kind() != std::io::ErrorKind::BrokenPipe
                {
                    warn!(command = name, error = %e, "Failed to forward stdin");
                }
            }
        }
    };

    if status.success() {
        Ok(())
    } else {
        Err(CommandError::Failed(format!("{name}: {status}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;

    struct Counter(Arc<AtomicUsize>);

    impl CommandHandler for Counter {
        fn call<'a>(&'a self, _io: &'a mut StageIo, _args: &'a [String]) -> HandlerFuture<'a> {
            Box::pin(async move {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    struct Greet;

    impl CommandHandler for Greet {
        fn call<'a>(&'a self, io: &'a mut StageIo, args: &'a [String]) -> HandlerFuture<'a> {
            Box::pin(async move {
                let line = format!("hello {}\n", args.join(" "));
                io.stdout.write_all(line.as_bytes()).await?;
                Ok(())
            })
        }
    }

    struct Fail;

    impl CommandHandler for Fail {
        fn call<'a>(&'a self, _io: &'a mut StageIo, _args: &'a [String]) -> HandlerFuture<'a> {
            Box::pin(async { Err(CommandError::Failed("boom".into())) })
        }
    }

    #[tokio::test]
    async fn registered_handler_writes_stdout() {
        let mut registry = CommandRegistry::new();
        registry.register("greet", Greet);

        let (out_w, mut out_r) = tokio::io::duplex(1024);
        let mut io = StageIo::new(tokio::io::empty(), out_w, tokio::io::sink());
        registry
            .invoke("greet", &["world".to_string()], &mut io)
            .await
            .unwrap();
        drop(io);

        let mut out = String::new();
        out_r.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world\n");
    }

    #[tokio::test]
    async fn shared_dependency_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut registry = CommandRegistry::new();
        registry.register("setup", Counter(count.clone()));
        registry.register_with_deps("a", Greet, vec![Invocation::new("setup", ["x"])]);
        registry.register_with_deps(
            "b",
            Greet,
            vec![
                Invocation::new("setup", ["x"]),
                Invocation::new("a", Vec::<String>::new()),
            ],
        );

        registry.invoke("b", &[], &mut StageIo::null()).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // A fresh top-level invocation runs it again.
        registry.invoke("a", &[], &mut StageIo::null()).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dependency_with_other_args_is_distinct() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut registry = CommandRegistry::new();
        registry.register("setup", Counter(count.clone()));
        registry.register_with_deps(
            "job",
            Greet,
            vec![Invocation::new("setup", ["1"]), Invocation::new("setup", ["2"])],
        );

        registry.invoke("job", &[], &mut StageIo::null()).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failing_dependency_blocks_command() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut registry = CommandRegistry::new();
        registry.register("broken", Fail);
        registry.register_with_deps(
            "job",
            Counter(count.clone()),
            vec![Invocation::new("broken", Vec::<String>::new())],
        );

        let err = registry
            .invoke("job", &[], &mut StageIo::null())
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Dependency { ref name, .. } if name == "job"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_program_is_not_found() {
        let registry = CommandRegistry::new();
        let err = registry
            .invoke("remsh-definitely-not-a-program", &[], &mut StageIo::null())
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn external_program_output_is_bridged() {
        let registry = CommandRegistry::new();
        let (out_w, mut out_r) = tokio::io::duplex(1024);
        let mut io = StageIo::new(tokio::io::empty(), out_w, tokio::io::sink());
        registry
            .invoke("echo", &["hi".to_string()], &mut io)
            .await
            .unwrap();
        drop(io);

        let mut out = String::new();
        out_r.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hi\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn external_nonzero_exit_fails() {
        let registry = CommandRegistry::new();
        let err = registry
            .invoke("false", &[], &mut StageIo::null())
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Failed(_)));
    }

    #[test]
    fn names_are_sorted() {
        let mut registry = CommandRegistry::new();
        registry.register("zeta", Fail);
        registry.register("alpha", Fail);
        assert_eq!(registry.names(), vec!["alpha", "zeta"]);
        assert!(registry.contains("zeta"));
        assert!(!registry.contains("beta"));
    }
}
