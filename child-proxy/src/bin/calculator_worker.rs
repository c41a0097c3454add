//! Calculator worker used by the process-level integration tests.
//!
//! Started by a controller with the autostart sentinel; run by hand it only
//! prints a notice and exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use child_proxy::{
    File, LoggingContext, RemoteError, Served, TargetRegistry, WorkerConfig, autostart_requested,
    remote_contract, run_worker,
};
use serde_json::Value;

remote_contract! {
    contract Calculator {
        client: CalculatorClient;
        service: CalculatorService;

        fn add(a: i64, b: i64) -> i64;
        fn fail(message: String) -> ();
        fn rename(file: File, name: String) -> File;
        fn delayed(millis: u64, value: String) -> String;
        fn pid() -> u32;
        fn exit(code: i32) -> ();
        fn stall_dispose() -> ();
        fn shout(line: String) -> ();
    }
}

#[derive(Default)]
struct Calc {
    stall_dispose: AtomicBool,
}

impl CalculatorService for Calc {
    async fn add(&self, a: i64, b: i64) -> Result<i64, RemoteError> {
        tracing::debug!(a, b, "add");
        Ok(a + b)
    }

    async fn fail(&self, message: String) -> Result<(), RemoteError> {
        Err(RemoteError::failed(message))
    }

    async fn rename(&self, file: File, name: String) -> Result<File, RemoteError> {
        Ok(File { name, ..file })
    }

    async fn delayed(&self, millis: u64, value: String) -> Result<String, RemoteError> {
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(value)
    }

    async fn pid(&self) -> Result<u32, RemoteError> {
        Ok(std::process::id())
    }

    async fn exit(&self, code: i32) -> Result<(), RemoteError> {
        std::process::exit(code)
    }

    async fn stall_dispose(&self) -> Result<(), RemoteError> {
        self.stall_dispose.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shout(&self, line: String) -> Result<(), RemoteError> {
        println!("{line}");
        // A subprocess inherits fd 1 as well.
        let status = std::process::Command::new("echo")
            .arg(&line)
            .status()
            .map_err(|e| RemoteError::failed(format!("echo failed: {e}")))?;
        if !status.success() {
            return Err(RemoteError::failed(format!("echo exited with {status}")));
        }
        Ok(())
    }

    async fn on_dispose(&self) -> Result<(), RemoteError> {
        if self.stall_dispose.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(())
    }
}

fn calculator(
    args: Vec<Value>,
    context: &LoggingContext,
) -> Result<Served<Calculator, Calc>, RemoteError> {
    if !args.is_empty() {
        return Err(RemoteError::invalid_arguments(
            "calculator takes no constructor arguments",
        ));
    }
    tracing::info!(filter = %context.filter, "Creating calculator");
    Ok(Calculator::target(Calc::default()))
}

fn main() -> anyhow::Result<()> {
    if !autostart_requested(std::env::args()) {
        eprintln!("calculator-worker is started by a child-proxy controller, nothing to do");
        return Ok(());
    }

    let targets = TargetRegistry::new().with("calculator", calculator);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run_worker(WorkerConfig::new(targets)));
    // A pending stdin read would keep a regular shutdown waiting forever.
    runtime.shutdown_background();
    result?;
    Ok(())
}
