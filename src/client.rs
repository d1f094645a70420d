//! RPC client: request/response over two queues, paired by correlation id.
//!
//! A call publishes its request with a fresh correlation id and then reads
//! the response queue until its own id shows up. Deliveries for other calls
//! are nacked with requeue so a concurrent caller can claim them. On timeout
//! the call gives up; a response arriving later is left for whichever
//! consumer reads it next.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::ClientError;
use crate::language::Language;
use crate::mq::{Broker, ExecutionRequest, ExecutionResponse, Outgoing};
use crate::runtime::RunResult;

/// Caller side of the execution queues for one language.
pub struct RpcClient {
    broker: Arc<dyn Broker>,
    send_queue: String,
    recv_queue: String,
    ceiling: Duration,
}

impl RpcClient {
    pub fn new(
        broker: Arc<dyn Broker>,
        send_queue: impl Into<String>,
        recv_queue: impl Into<String>,
        ceiling: Duration,
    ) -> Self {
        Self {
            broker,
            send_queue: send_queue.into(),
            recv_queue: recv_queue.into(),
            ceiling,
        }
    }

    /// Client for the queues named in `config`.
    pub fn from_config(broker: Arc<dyn Broker>, config: &Config) -> Self {
        Self::new(
            broker,
            config.mq.recv_queue.clone(),
            config.mq.resp_queue.clone(),
            config.client.timeout,
        )
    }

    /// Run `code` remotely, bounded by the client's ceiling.
    pub async fn run(&self, code: &str) -> Result<RunResult, ClientError> {
        self.invoke(code, self.ceiling).await
    }

    /// Run `code` remotely, bounded by `timeout` and the client's ceiling.
    #[instrument(skip(self, code), fields(queue = %self.send_queue, code_len = code.len()))]
    pub async fn invoke(&self, code: &str, timeout: Duration) -> Result<RunResult, ClientError> {
        let limit = timeout.min(self.ceiling);
        let correlation_id = Uuid::new_v4().to_string();

        match tokio::time::timeout(limit, self.round_trip(code, &correlation_id)).await {
            Ok(Ok(response)) => Ok(response.into()),
            Ok(Err(e)) => {
                error!(error = %e, correlation_id = %correlation_id, "Round trip failed");
                Err(ClientError::Unavailable)
            }
            Err(_) => {
                warn!(correlation_id = %correlation_id, timeout = ?limit, "No response in time");
                Err(ClientError::Timeout(limit))
            }
        }
    }

    async fn round_trip(
        &self,
        code: &str,
        correlation_id: &str,
    ) -> anyhow::Result<ExecutionResponse> {
        self.broker.declare(&self.send_queue).await?;
        self.broker.declare(&self.recv_queue).await?;

        let body = serde_json::to_vec(&ExecutionRequest { code: code.into() })
            .context("Failed to encode request")?;
        self.broker
            .publish(
                &self.send_queue,
                Outgoing {
                    body,
                    correlation_id: Some(correlation_id.to_string()),
                },
            )
            .await?;
        debug!(correlation_id = %correlation_id, "Published request");

        let mut deliveries = self.broker.consume(&self.recv_queue).await?;
        while let Some(msg) = deliveries.next().await {
            let msg = msg?;
            if msg.correlation_id.as_deref() != Some(correlation_id) {
                msg.nack(true).await?;
                continue;
            }

            return match serde_json::from_slice::<ExecutionResponse>(&msg.body) {
                Ok(response) => {
                    msg.ack().await?;
                    Ok(response)
                }
                Err(e) => {
                    msg.reject(false).await?;
                    Err(e).context("Failed to decode response")
                }
            };
        }

        anyhow::bail!("Response stream ended before a reply arrived")
    }
}

/// Per-language entry point for in-process callers such as a web front end.
#[derive(Default)]
pub struct Runners {
    clients: HashMap<Language, RpcClient>,
}

impl Runners {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, language: Language, client: RpcClient) -> Self {
        self.clients.insert(language, client);
        self
    }

    pub async fn run(&self, language: Language, code: &str) -> Result<RunResult, ClientError> {
        let client = self
            .clients
            .get(&language)
            .ok_or(ClientError::Unsupported(language))?;
        client.run(code).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::error::RuntimeError;
    use crate::mq::memory::{MemoryBroker, Settlement};
    use crate::runtime::Executor;
    use crate::worker::Worker;

    const SEND: &str = "jsrunner";
    const RECV: &str = "jsrunner-response";

    struct Upper {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Executor for Upper {
        async fn run(&self, code: &str) -> Result<RunResult, RuntimeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RunResult {
                stdout: code.to_uppercase().into_bytes(),
                stderr: b"warn".to_vec(),
                exit_code: 0,
                duration: Duration::from_millis(3),
            })
        }
    }

    fn client(broker: &Arc<MemoryBroker>, ceiling: Duration) -> RpcClient {
        RpcClient::new(Arc::clone(broker) as Arc<dyn Broker>, SEND, RECV, ceiling)
    }

    #[tokio::test]
    async fn round_trip_through_worker() {
        let broker = MemoryBroker::new();
        let shutdown = CancellationToken::new();
        let worker = Worker::new(
            Arc::new(Upper {
                calls: AtomicUsize::new(0),
            }),
            Arc::clone(&broker) as Arc<dyn Broker>,
            SEND,
            RECV,
        );
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        let result = client(&broker, Duration::from_secs(5))
            .run("console.log('hi')")
            .await
            .unwrap();

        assert_eq!(result.stdout, b"CONSOLE.LOG('HI')");
        assert_eq!(result.stderr, b"warn");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.duration, Duration::from_millis(3));

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn missing_response_times_out() {
        let broker = MemoryBroker::new();
        let client = client(&broker, Duration::from_secs(20));

        let started = Instant::now();
        let err = client
            .invoke("1", Duration::from_millis(200))
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Timeout(d) if d == Duration::from_millis(200)));
        assert!(started.elapsed() < Duration::from_secs(5));
        // the request is still out there, nobody answered it
        assert_eq!(broker.pending(SEND).len(), 1);
    }

    #[tokio::test]
    async fn ceiling_caps_caller_timeout() {
        let broker = MemoryBroker::new();
        let client = client(&broker, Duration::from_millis(100));

        let err = client.invoke("1", Duration::from_secs(60)).await.unwrap_err();

        assert!(matches!(err, ClientError::Timeout(d) if d == Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn foreign_responses_are_left_for_their_owner() {
        let broker = MemoryBroker::new();
        let stray = ExecutionResponse {
            stdout: b"not yours".to_vec(),
            stderr: Vec::new(),
            exit_code: 0,
            time_took: Duration::ZERO,
        };
        broker.push(RECV, serde_json::to_vec(&stray).unwrap(), Some("someone-else"));

        let client = client(&broker, Duration::from_millis(200));
        let err = client.run("1").await.unwrap_err();

        assert!(matches!(err, ClientError::Timeout(_)));
        let settlements = broker.settlements(RECV);
        assert!(!settlements.is_empty());
        assert!(settlements
            .iter()
            .all(|s| *s == Settlement::Nack { requeue: true }));
        let pending = broker.pending(RECV);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].correlation_id.as_deref(), Some("someone-else"));
    }

    #[tokio::test]
    async fn undecodable_response_is_generic_failure() {
        let broker = MemoryBroker::new();
        let client = Arc::new(client(&broker, Duration::from_secs(5)));

        // answer the request with garbage under the right correlation id
        let responder = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                let mut requests = broker.consume(SEND).await.unwrap();
                let req = requests.next().await.unwrap().unwrap();
                let id = req.correlation_id.clone();
                req.ack().await.unwrap();
                broker.push(RECV, "garbage", id.as_deref());
            })
        };

        let err = client.run("1").await.unwrap_err();
        responder.await.unwrap();

        assert!(matches!(err, ClientError::Unavailable));
        assert_eq!(err.to_string(), "execution service unavailable");
        assert_eq!(
            broker.settlements(RECV),
            [Settlement::Reject { requeue: false }]
        );
    }

    #[tokio::test]
    async fn concurrent_calls_get_their_own_results() {
        let broker = MemoryBroker::new();
        let shutdown = CancellationToken::new();
        let worker = Worker::new(
            Arc::new(Upper {
                calls: AtomicUsize::new(0),
            }),
            Arc::clone(&broker) as Arc<dyn Broker>,
            SEND,
            RECV,
        );
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        let client = client(&broker, Duration::from_secs(5));
        let (a, b, c) = tokio::join!(client.run("a"), client.run("b"), client.run("c"));

        assert_eq!(a.unwrap().stdout, b"A");
        assert_eq!(b.unwrap().stdout, b"B");
        assert_eq!(c.unwrap().stdout, b"C");

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn runners_dispatch_by_language() {
        let broker = MemoryBroker::new();
        let runners = Runners::new().with(
            Language::JavaScript,
            client(&broker, Duration::from_millis(50)),
        );

        let err = runners.run(Language::Go, "package main").await.unwrap_err();
        assert!(matches!(err, ClientError::Unsupported(Language::Go)));

        let err = runners
            .run(Language::JavaScript, "1")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
    }
}
