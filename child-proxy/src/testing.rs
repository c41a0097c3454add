//! In-process fixtures shared by the unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::bridge::protocol::RemoteError;
use crate::bridge::revive::File;
use crate::contract::Served;
use crate::logging::LoggingContext;
use crate::worker::{Plugin, PluginRegistry, TargetRegistry, WorkerConfig};

crate::remote_contract! {
    pub contract Calculator {
        client: CalculatorClient;
        service: CalculatorService;

        fn add(a: i64, b: i64) -> i64;
        fn offset() -> i64;
        fn fail(message: String) -> ();
        fn explode(message: String) -> ();
        fn rename(file: File, name: String) -> File;
        fn delayed(millis: u64, value: String) -> String;
    }
}

pub const CALCULATOR: &str = "calculator";

#[derive(Debug, Default)]
pub struct Calc {
    pub offset: i64,
    pub disposed: Arc<AtomicBool>,
}

impl CalculatorService for Calc {
    async fn add(&self, a: i64, b: i64) -> Result<i64, RemoteError> {
        Ok(a + b)
    }

    async fn offset(&self) -> Result<i64, RemoteError> {
        Ok(self.offset)
    }

    async fn fail(&self, message: String) -> Result<(), RemoteError> {
        Err(RemoteError::failed(message))
    }

    async fn explode(&self, message: String) -> Result<(), RemoteError> {
        panic!("{message}")
    }

    async fn rename(&self, file: File, name: String) -> Result<File, RemoteError> {
        Ok(File { name, ..file })
    }

    async fn delayed(&self, millis: u64, value: String) -> Result<String, RemoteError> {
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(value)
    }

    async fn on_dispose(&self) -> Result<(), RemoteError> {
        self.disposed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn calculator(
    args: Vec<Value>,
    _context: &LoggingContext,
) -> Result<Served<Calculator, Calc>, RemoteError> {
    let offset = match args.first() {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| RemoteError::invalid_arguments(e.to_string()))?,
        None => 0,
    };
    Ok(Calculator::target(Calc {
        offset,
        ..Calc::default()
    }))
}

/// Registers the `scaled` target, a calculator with offset 100.
pub struct ScaledPlugin;

#[async_trait]
impl Plugin for ScaledPlugin {
    async fn load(&self, targets: &mut TargetRegistry) -> Result<(), RemoteError> {
        targets.register("scaled", |_, _| {
            Ok(Calculator::target(Calc {
                offset: 100,
                ..Calc::default()
            }))
        });
        Ok(())
    }
}

pub fn targets() -> TargetRegistry {
    TargetRegistry::new()
        .with(CALCULATOR, calculator)
        .with("broken", |_, _| {
            Err::<Served<Calculator, Calc>, _>(RemoteError::new("setup", "constructor failed"))
        })
        .with("panicking", |_, _| -> Result<Served<Calculator, Calc>, RemoteError> {
            panic!("constructor exploded")
        })
}

pub fn worker_config() -> WorkerConfig {
    WorkerConfig::new(targets())
        .with_plugins(PluginRegistry::new().with("scaled", ScaledPlugin))
        .with_log_forwarding(false)
}
