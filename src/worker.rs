//! Queue worker: consumes execution requests and publishes results.
//!
//! Two tasks cooperate. The consumer decodes each request, runs it and
//! settles the delivery; finished responses go over a channel to the
//! publisher, which owns the outbound side. Closing that channel is the
//! publisher's shutdown signal, so everything already computed is still
//! published.
//!
//! Settlement policy per message:
//! - undecodable body: reject, no requeue
//! - runtime error: nack with requeue
//! - panic while handling: nack with requeue, or reject if it was already
//!   redelivered once
//! - success (any exit code): hand off the response, then ack

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::mq::{Broker, ExecutionRequest, ExecutionResponse, Message, Outgoing};
use crate::runtime::Executor;

/// Capacity of the consumer → publisher channel.
const RESPONSE_BUFFER: usize = 64;

/// A response waiting to be published.
#[derive(Debug)]
struct Reply {
    correlation_id: Option<String>,
    response: ExecutionResponse,
}

/// What to do with a delivery once handling is over.
#[derive(Debug)]
enum Outcome {
    Respond(ExecutionResponse),
    Requeue,
    Discard,
}

/// Consumes one inbound queue and answers on one outbound queue.
pub struct Worker {
    executor: Arc<dyn Executor>,
    broker: Arc<dyn Broker>,
    recv_queue: String,
    resp_queue: String,
    seq: AtomicU64,
}

impl Worker {
    pub fn new(
        executor: Arc<dyn Executor>,
        broker: Arc<dyn Broker>,
        recv_queue: impl Into<String>,
        resp_queue: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            broker,
            recv_queue: recv_queue.into(),
            resp_queue: resp_queue.into(),
            seq: AtomicU64::new(0),
        }
    }

    /// Run until `shutdown` fires or the inbound stream ends.
    ///
    /// Returns after the publisher has flushed every computed response.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.broker.declare(&self.recv_queue).await?;
        self.broker.declare(&self.resp_queue).await?;

        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        let publisher = tokio::spawn(produce(
            Arc::clone(&self.broker),
            self.resp_queue.clone(),
            rx,
        ));

        // tx is dropped when consume returns, which stops the publisher
        let consumed = self.consume(&shutdown, tx).await;

        publisher.await.context("Publisher task failed")?;
        info!("Stopped message production");
        consumed
    }

    async fn consume(&self, shutdown: &CancellationToken, tx: mpsc::Sender<Reply>) -> Result<()> {
        let mut deliveries = self.broker.consume(&self.recv_queue).await?;
        info!(queue = %self.recv_queue, "Consuming execution requests");

        loop {
            let next = tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    info!("Message consumption cancelled");
                    return Ok(());
                }
                next = deliveries.next() => next,
            };

            let msg = match next {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(e.context("Inbound delivery stream failed")),
                None => {
                    warn!("Inbound delivery stream ended");
                    return Ok(());
                }
            };

            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            let span = info_span!(
                "message",
                seq,
                correlation_id = msg.correlation_id.as_deref().unwrap_or("")
            );
            let keep_going = self.handle(msg, shutdown, &tx).instrument(span).await;
            if !keep_going {
                return Ok(());
            }
        }
    }

    /// Handle and settle one delivery. Returns `false` when shutting down.
    async fn handle(
        &self,
        msg: Message,
        shutdown: &CancellationToken,
        tx: &mpsc::Sender<Reply>,
    ) -> bool {
        let outcome = tokio::select! {
            biased;
            () = shutdown.cancelled() => None,
            outcome = self.process(&msg) => Some(outcome),
        };

        let Some(outcome) = outcome else {
            info!("Shutdown during execution, requeueing message");
            settle(msg.nack(true).await, "nack");
            return false;
        };

        match outcome {
            Outcome::Respond(response) => {
                let reply = Reply {
                    correlation_id: msg.correlation_id.clone(),
                    response,
                };
                if tx.send(reply).await.is_err() {
                    error!("Publisher is gone, requeueing message");
                    settle(msg.nack(true).await, "nack");
                    return false;
                }
                settle(msg.ack().await, "ack");
            }
            Outcome::Requeue => settle(msg.nack(true).await, "nack"),
            Outcome::Discard => settle(msg.reject(false).await, "reject"),
        }
        true
    }

    /// Decode and execute one delivery, containing any panic.
    async fn process(&self, msg: &Message) -> Outcome {
        let request: ExecutionRequest = match serde_json::from_slice(&msg.body) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "Could not decode broker's message body");
                return Outcome::Discard;
            }
        };
        if msg.correlation_id.is_none() {
            warn!("Request has no correlation id; its response cannot be matched");
        }

        let run = AssertUnwindSafe(self.executor.run(&request.code)).catch_unwind();
        match run.await {
            Ok(Ok(result)) => {
                debug!(exit_code = result.exit_code, "Executed request");
                Outcome::Respond(result.into())
            }
            Ok(Err(e)) => {
                error!(error = %e, "Could not execute code from mq");
                Outcome::Requeue
            }
            Err(cause) => {
                error!(cause = %panic_message(&*cause), "Recovered from panic while handling message");
                if msg.redelivered {
                    Outcome::Discard
                } else {
                    Outcome::Requeue
                }
            }
        }
    }
}

/// Publish every reply until the channel closes.
async fn produce(broker: Arc<dyn Broker>, queue: String, mut rx: mpsc::Receiver<Reply>) {
    while let Some(reply) = rx.recv().await {
        let body = match serde_json::to_vec(&reply.response) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "Could not serialize response");
                continue;
            }
        };

        debug!(queue = %queue, msg_len = body.len(), "Producing message to mq");
        let outgoing = Outgoing {
            body,
            correlation_id: reply.correlation_id,
        };
        if let Err(e) = broker.publish(&queue, outgoing).await {
            error!(error = %e, "Could not send a message to mq");
        }
    }
}

fn settle(result: Result<()>, action: &str) {
    if let Err(e) = result {
        error!(error = %e, action, "Failed to settle message");
    }
}

fn panic_message(cause: &(dyn Any + Send)) -> String {
    cause
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| cause.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".into())
}
