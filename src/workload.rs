//! Workload module abstraction
//!
//! A workload decides what gets submitted to the SUT; the rate controller
//! decides when the worker asks for the next one. Modules are
//! built per round from a registry key, bound to the round through
//! [`WorkloadContext`] and then driven by concurrent in-flight tasks, so
//! every method takes `&self` and mutable state lives behind interior
//! locks or atomics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::connector::SutConnector;
use crate::protocol::WorkloadSpec;

/// Everything a workload learns when a round is prepared.
#[derive(Clone)]
pub struct WorkloadContext {
    pub worker_index: u64,
    pub total_workers: u64,
    pub round_index: u64,
    /// Arguments from the round's workload definition.
    pub round_arguments: Value,
    /// This worker's share of the connector-prepared arguments.
    pub worker_arguments: Value,
    /// The connector to submit through, already wired to the round's
    /// statistics.
    pub sut: Arc<dyn SutConnector>,
}

/// One user workload, driven for the duration of a single round.
#[async_trait]
pub trait WorkloadModule: Send + Sync {
    /// Registry name of the module.
    fn name(&self) -> &'static str;

    /// Bind the module to one round. Called once before any submit.
    async fn initialize(&self, context: WorkloadContext) -> Result<()>;

    /// Build and submit one transaction through the connector.
    async fn submit_transaction(&self) -> Result<()>;

    /// Tear down whatever initialize set up. Called once after the round.
    async fn cleanup(&self) -> Result<()>;
}

/// Build a workload module by registry key.
pub fn build_workload(spec: &WorkloadSpec) -> Result<Arc<dyn WorkloadModule>> {
    match spec.module.as_str() {
        "noop" => Ok(Arc::new(NoopWorkload::default())),
        "counter" => Ok(Arc::new(CounterWorkload::default())),
        other => bail!("Unknown workload module '{}'", other),
    }
}

/// Submits empty requests. The smallest possible workload, used to
/// measure framework and connector overhead.
#[derive(Default)]
pub struct NoopWorkload {
    context: Mutex<Option<WorkloadContext>>,
}

#[async_trait]
impl WorkloadModule for NoopWorkload {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn initialize(&self, context: WorkloadContext) -> Result<()> {
        *self.context.lock() = Some(context);
        Ok(())
    }

    async fn submit_transaction(&self) -> Result<()> {
        let sut = {
            let guard = self.context.lock();
            let context = guard
                .as_ref()
                .ok_or_else(|| anyhow!("noop workload was never initialized"))?;
            Arc::clone(&context.sut)
        };
        sut.send_requests(&[Value::Null]).await?;
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        self.context.lock().take();
        Ok(())
    }
}

/// Options for the counter workload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterOptions {
    pub start: u64,
}

/// Submits a strictly increasing counter value per transaction. Values
/// are strided by the pool size so no two workers ever submit the same
/// one.
#[derive(Default)]
pub struct CounterWorkload {
    context: Mutex<Option<WorkloadContext>>,
    options: Mutex<CounterOptions>,
    sequence: AtomicU64,
}

#[async_trait]
impl WorkloadModule for CounterWorkload {
    fn name(&self) -> &'static str {
        "counter"
    }

    async fn initialize(&self, context: WorkloadContext) -> Result<()> {
        let options: CounterOptions = if context.round_arguments.is_null() {
            CounterOptions::default()
        } else {
            serde_json::from_value(context.round_arguments.clone())
                .map_err(|e| anyhow!("Invalid counter workload arguments: {}", e))?
        };
        debug!(
            "Counter workload starting at {} for worker {}",
            options.start, context.worker_index
        );
        *self.options.lock() = options;
        self.sequence.store(0, Ordering::Relaxed);
        *self.context.lock() = Some(context);
        Ok(())
    }

    async fn submit_transaction(&self) -> Result<()> {
        let (sut, worker_index, total_workers, start) = {
            let guard = self.context.lock();
            let context = guard
                .as_ref()
                .ok_or_else(|| anyhow!("counter workload was never initialized"))?;
            (
                Arc::clone(&context.sut),
                context.worker_index,
                context.total_workers.max(1),
                self.options.lock().start,
            )
        };
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let value = start + worker_index + seq * total_workers;
        let request = json!({ "operation": "add", "value": value });
        sut.send_requests(&[request]).await?;
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        self.context.lock().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::SutRequest;
    use crate::stats::TxStatus;

    /// Connector double that records every request and reports success.
    #[derive(Default)]
    struct RecordingConnector {
        requests: Mutex<Vec<SutRequest>>,
    }

    #[async_trait]
    impl SutConnector for RecordingConnector {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn worker_index(&self) -> i64 {
            0
        }

        async fn init(&self, _for_worker: bool) -> Result<()> {
            Ok(())
        }

        async fn install_contracts(&self) -> Result<()> {
            Ok(())
        }

        async fn prepare_worker_arguments(&self, total_workers: u64) -> Result<Vec<Value>> {
            Ok(vec![Value::Null; total_workers as usize])
        }

        async fn open_context(&self, _round_index: u64, _worker_args: &Value) -> Result<()> {
            Ok(())
        }

        async fn release_context(&self) -> Result<()> {
            Ok(())
        }

        async fn send_requests(&self, requests: &[SutRequest]) -> Result<Vec<TxStatus>> {
            self.requests.lock().extend_from_slice(requests);
            Ok(requests
                .iter()
                .enumerate()
                .map(|(i, _)| {
                    let mut status = TxStatus::new(format!("rec-{}", i));
                    status.success();
                    status
                })
                .collect())
        }
    }

    fn context_for(
        sut: Arc<dyn SutConnector>,
        worker_index: u64,
        total_workers: u64,
        round_arguments: Value,
    ) -> WorkloadContext {
        WorkloadContext {
            worker_index,
            total_workers,
            round_index: 0,
            round_arguments,
            worker_arguments: Value::Null,
            sut,
        }
    }

    #[test]
    fn test_registry_resolves_builtins() {
        let spec = WorkloadSpec {
            module: "noop".to_string(),
            arguments: Value::Null,
        };
        assert_eq!(build_workload(&spec).unwrap().name(), "noop");

        let spec = WorkloadSpec {
            module: "counter".to_string(),
            arguments: Value::Null,
        };
        assert_eq!(build_workload(&spec).unwrap().name(), "counter");

        let spec = WorkloadSpec {
            module: "imaginary".to_string(),
            arguments: Value::Null,
        };
        assert!(build_workload(&spec).is_err());
    }

    #[tokio::test]
    async fn test_submit_before_initialize_is_rejected() {
        let workload = NoopWorkload::default();
        let err = workload.submit_transaction().await.unwrap_err();
        assert!(err.to_string().contains("never initialized"));
    }

    #[tokio::test]
    async fn test_noop_submits_one_request_per_call() {
        let recorder = Arc::new(RecordingConnector::default());
        let workload = NoopWorkload::default();
        workload
            .initialize(context_for(recorder.clone(), 0, 1, Value::Null))
            .await
            .unwrap();

        for _ in 0..3 {
            workload.submit_transaction().await.unwrap();
        }
        assert_eq!(recorder.requests.lock().len(), 3);

        workload.cleanup().await.unwrap();
        assert!(workload.submit_transaction().await.is_err());
    }

    #[tokio::test]
    async fn test_counter_values_are_strided_across_workers() {
        let recorder = Arc::new(RecordingConnector::default());
        let workload = CounterWorkload::default();
        workload
            .initialize(context_for(
                recorder.clone(),
                1,
                2,
                json!({ "start": 100 }),
            ))
            .await
            .unwrap();

        for _ in 0..3 {
            workload.submit_transaction().await.unwrap();
        }

        let values: Vec<u64> = recorder
            .requests
            .lock()
            .iter()
            .map(|r| r["value"].as_u64().unwrap())
            .collect();
        assert_eq!(values, [101, 103, 105]);
    }

    #[tokio::test]
    async fn test_counter_concurrent_submits_stay_unique() {
        let recorder = Arc::new(RecordingConnector::default());
        let workload: Arc<dyn WorkloadModule> = Arc::new(CounterWorkload::default());
        workload
            .initialize(context_for(recorder.clone(), 0, 1, Value::Null))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let workload = Arc::clone(&workload);
            handles.push(tokio::spawn(async move {
                workload.submit_transaction().await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut values: Vec<u64> = recorder
            .requests
            .lock()
            .iter()
            .map(|r| r["value"].as_u64().unwrap())
            .collect();
        values.sort_unstable();
        assert_eq!(values, (0..8).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_counter_rejects_malformed_arguments() {
        let recorder = Arc::new(RecordingConnector::default());
        let workload = CounterWorkload::default();
        let err = workload
            .initialize(context_for(recorder, 0, 1, json!({ "start": "not-a-number" })))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid counter workload arguments"));
    }
}
