//! Event-stream routes.
//!
//! A stream route consumes one broker topic and publishes the result of
//! `consume → process → produce` for every record to another topic.
//!
//! Binding acquires, in order, an admin handle, a consumer on the input topic
//! and, in the background, a producer. Records may arrive before the producer
//! is ready; their outputs wait in the route's [`Outbox`] and are flushed in
//! order once it attaches.
//!
//! Records are handled concurrently: the consumer loop hands each record to
//! its own task and moves on, so outputs may be published in a different
//! order than the inputs were received.

use crate::codec::{BoxError, Encode};
use crate::metrics;
use crate::pipeline::{stage, PipelineError, Stage, StageName};
use crate::route::{BindContext, BoundRoute, Route, RouteDescriptor, RouteError, RouteKind, UnbindError};
use async_trait::async_trait;
use bytes::Bytes;
use orbit_transport::{AdminHandle, Broker, ConsumerHandle, ProducerHandle, Record, TransportError};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};

/// Pause after a failed receive before polling the consumer again.
const RECV_BACKOFF: Duration = Duration::from_millis(100);

/// A consume/process/produce route over the event broker.
pub struct StreamRoute<C, P, O> {
    descriptor: RouteDescriptor,
    input_topic: String,
    output_topic: String,
    consume: Stage<Record, C>,
    process: Stage<C, P>,
    produce: Stage<P, O>,
    bound: AtomicBool,
}

impl StreamRoute<(), (), ()> {
    /// Start building a route from `input_topic` to `output_topic`.
    pub fn builder(
        id: impl Into<String>,
        input_topic: impl Into<String>,
        output_topic: impl Into<String>,
    ) -> StreamRouteBuilder {
        StreamRouteBuilder {
            descriptor: RouteDescriptor::new(id, RouteKind::StreamInbound),
            input_topic: input_topic.into(),
            output_topic: output_topic.into(),
        }
    }
}

impl<C, P, O> StreamRoute<C, P, O> {
    #[must_use]
    pub fn input_topic(&self) -> &str {
        &self.input_topic
    }

    #[must_use]
    pub fn output_topic(&self) -> &str {
        &self.output_topic
    }
}

pub struct StreamRouteBuilder {
    descriptor: RouteDescriptor,
    input_topic: String,
    output_topic: String,
}

impl StreamRouteBuilder {
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.descriptor = self.descriptor.with_description(description);
        self
    }

    /// Set the stage that decodes a raw record.
    pub fn consume<C, E, F, Fut>(self, f: F) -> Consuming<C>
    where
        C: Send + 'static,
        E: Into<BoxError>,
        F: Fn(Record) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C, E>> + Send + 'static,
    {
        Consuming {
            builder: self,
            consume: stage(f),
        }
    }
}

pub struct Consuming<C> {
    builder: StreamRouteBuilder,
    consume: Stage<Record, C>,
}

impl<C: Send + 'static> Consuming<C> {
    pub fn process<P, E, F, Fut>(self, f: F) -> Processing<C, P>
    where
        P: Send + 'static,
        E: Into<BoxError>,
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<P, E>> + Send + 'static,
    {
        Processing {
            builder: self.builder,
            consume: self.consume,
            process: stage(f),
        }
    }
}

pub struct Processing<C, P> {
    builder: StreamRouteBuilder,
    consume: Stage<Record, C>,
    process: Stage<C, P>,
}

impl<C: Send + 'static, P: Send + 'static> Processing<C, P> {
    /// Finish with the stage whose output is published to the output topic.
    pub fn produce<O, E, F, Fut>(self, f: F) -> StreamRoute<C, P, O>
    where
        O: Encode + Send + 'static,
        E: Into<BoxError>,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
    {
        StreamRoute {
            descriptor: self.builder.descriptor,
            input_topic: self.builder.input_topic,
            output_topic: self.builder.output_topic,
            consume: self.consume,
            process: self.process,
            produce: stage(f),
            bound: AtomicBool::new(false),
        }
    }
}

/// What happened to a published output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the producer.
    Sent,
    /// Held until the producer attaches.
    Buffered,
    /// Discarded: no producer will ever send it.
    Discarded,
}

enum OutboxState {
    Pending(VecDeque<Bytes>),
    Ready(Arc<dyn ProducerHandle>),
    /// Producer acquisition failed.
    Failed,
    Closed,
}

/// The publishing side of a stream route.
///
/// Until a producer is attached, outputs are buffered up to `capacity`,
/// dropping the oldest beyond that.
pub struct Outbox {
    route: String,
    topic: String,
    capacity: usize,
    state: Mutex<OutboxState>,
}

impl Outbox {
    #[must_use]
    pub fn new(route: impl Into<String>, topic: impl Into<String>, capacity: usize) -> Self {
        Self {
            route: route.into(),
            topic: topic.into(),
            capacity,
            state: Mutex::new(OutboxState::Pending(VecDeque::new())),
        }
    }

    /// Publish `payload` to the output topic, or hold it until the producer
    /// is ready.
    ///
    /// # Errors
    ///
    /// Returns the producer's error if sending fails.
    pub async fn publish(&self, payload: Bytes) -> Result<Delivery, TransportError> {
        let producer = {
            let mut state = self.state.lock().await;
            match &mut *state {
                OutboxState::Ready(producer) => Arc::clone(producer),
                OutboxState::Pending(queue) => return Ok(self.buffer(queue, payload)),
                OutboxState::Failed => {
                    error!(route = %self.route, topic = %self.topic, "No producer available, output dropped");
                    return Ok(Delivery::Discarded);
                }
                OutboxState::Closed => {
                    debug!(route = %self.route, topic = %self.topic, "Outbox closed, output dropped");
                    return Ok(Delivery::Discarded);
                }
            }
        };
        producer.send(&self.topic, payload).await?;
        Ok(Delivery::Sent)
    }

    fn buffer(&self, queue: &mut VecDeque<Bytes>, payload: Bytes) -> Delivery {
        if self.capacity == 0 {
            warn!(route = %self.route, topic = %self.topic, "Producer not ready, output dropped");
            return Delivery::Discarded;
        }
        if queue.len() >= self.capacity {
            queue.pop_front();
            warn!(
                route = %self.route,
                topic = %self.topic,
                capacity = self.capacity,
                "Pending outputs full, dropping oldest"
            );
        }
        queue.push_back(payload);
        metrics::record_output_buffered(&self.route);
        trace!(route = %self.route, pending = queue.len(), "Output buffered until producer is ready");
        Delivery::Buffered
    }

    /// Attach the producer and flush buffered outputs in order.
    ///
    /// Outputs published while the flush is running wait for it to finish.
    ///
    /// # Errors
    ///
    /// Hands the producer back if the outbox is already closed or attached.
    pub async fn attach(
        &self,
        producer: Arc<dyn ProducerHandle>,
    ) -> Result<usize, Arc<dyn ProducerHandle>> {
        let mut state = self.state.lock().await;
        let queue = match &mut *state {
            OutboxState::Pending(queue) => std::mem::take(queue),
            _ => return Err(producer),
        };
        // Set before flushing so close() can still reclaim the producer if
        // this task is aborted mid-flush.
        *state = OutboxState::Ready(Arc::clone(&producer));

        let mut flushed = 0;
        for payload in queue {
            match producer.send(&self.topic, payload).await {
                Ok(()) => flushed += 1,
                Err(e) => {
                    error!(
                        route = %self.route,
                        stage = %StageName::Publish,
                        topic = %self.topic,
                        error = %e,
                        "Failed to flush buffered output"
                    );
                    metrics::record_stream_message(&self.route, metrics::DROPPED);
                }
            }
        }
        Ok(flushed)
    }

    /// Mark producer acquisition as failed, discarding buffered outputs.
    pub async fn fail(&self) {
        let mut state = self.state.lock().await;
        if let OutboxState::Pending(queue) = &*state {
            if !queue.is_empty() {
                error!(
                    route = %self.route,
                    topic = %self.topic,
                    discarded = queue.len(),
                    "Discarding buffered outputs"
                );
            }
            *state = OutboxState::Failed;
        }
    }

    /// Stop publishing. Returns the attached producer, if any.
    pub async fn close(&self) -> Option<Arc<dyn ProducerHandle>> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, OutboxState::Closed) {
            OutboxState::Ready(producer) => Some(producer),
            OutboxState::Pending(queue) if !queue.is_empty() => {
                warn!(
                    route = %self.route,
                    topic = %self.topic,
                    discarded = queue.len(),
                    "Closing with buffered outputs never sent"
                );
                None
            }
            _ => None,
        }
    }

    /// Number of outputs waiting for the producer.
    pub async fn pending(&self) -> usize {
        match &*self.state.lock().await {
            OutboxState::Pending(queue) => queue.len(),
            _ => 0,
        }
    }
}

/// The stages of a bound stream route.
struct StreamPipeline<C, P, O> {
    route: String,
    consume: Stage<Record, C>,
    process: Stage<C, P>,
    produce: Stage<P, O>,
    outbox: Arc<Outbox>,
}

impl<C, P, O> StreamPipeline<C, P, O>
where
    C: Send + 'static,
    P: Send + 'static,
    O: Encode + Send + 'static,
{
    async fn run(&self, record: Record) -> Result<Delivery, PipelineError> {
        let route = self.route.as_str();
        let consumed = (self.consume)(record)
            .await
            .map_err(|e| PipelineError::new(route, StageName::Consume, e))?;
        let processed = (self.process)(consumed)
            .await
            .map_err(|e| PipelineError::new(route, StageName::Process, e))?;
        let payload = (self.produce)(processed)
            .await
            .and_then(O::encode)
            .map_err(|e| PipelineError::new(route, StageName::Produce, e))?;
        self.outbox
            .publish(payload)
            .await
            .map_err(|e| PipelineError::new(route, StageName::Publish, e))
    }

    async fn handle(self: Arc<Self>, record: Record) {
        let topic = record.topic.clone();
        let offset = record.offset;

        match self.run(record).await {
            Ok(Delivery::Discarded) => {
                metrics::record_stream_message(&self.route, metrics::DROPPED);
            }
            Ok(delivery) => {
                trace!(route = %self.route, topic = %topic, offset, ?delivery, "Message processed");
                metrics::record_stream_message(&self.route, metrics::PROCESSED);
            }
            Err(e) => {
                error!(
                    route = %e.route,
                    stage = %e.stage,
                    topic = %topic,
                    offset,
                    error = %e.source,
                    "Stream pipeline failed, message dropped"
                );
                metrics::record_stream_message(&self.route, metrics::DROPPED);
            }
        }
    }
}

fn reap(route: &str, joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(route = %route, "Stream pipeline panicked, message dropped");
            metrics::record_stream_message(route, metrics::DROPPED);
        }
    }
}

/// Receive records until stopped, spawning one task per record.
///
/// Hands the consumer and the still-running tasks back so the caller can
/// drain and release them.
async fn consume_loop<C, P, O>(
    mut consumer: Box<dyn ConsumerHandle>,
    pipeline: Arc<StreamPipeline<C, P, O>>,
    mut stop: oneshot::Receiver<()>,
) -> (Box<dyn ConsumerHandle>, JoinSet<()>)
where
    C: Send + 'static,
    P: Send + 'static,
    O: Encode + Send + 'static,
{
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = &mut stop => break,

            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                reap(&pipeline.route, joined);
            }

            received = consumer.recv() => match received {
                Ok(Some(record)) => {
                    trace!(route = %pipeline.route, topic = %record.topic, offset = record.offset, "Record received");
                    tasks.spawn(Arc::clone(&pipeline).handle(record));
                }
                Ok(None) => {
                    info!(route = %pipeline.route, topic = %consumer.topic(), "Consumer closed");
                    break;
                }
                Err(e) => {
                    warn!(
                        route = %pipeline.route,
                        topic = %consumer.topic(),
                        error = %e,
                        "Receive failed"
                    );
                    tokio::time::sleep(RECV_BACKOFF).await;
                }
            },
        }
    }

    (consumer, tasks)
}

/// Wait for in-flight records, aborting whatever is left after `timeout`.
async fn drain(route: &str, tasks: &mut JoinSet<()>, timeout: Duration) {
    if tasks.is_empty() {
        return;
    }
    debug!(route = %route, in_flight = tasks.len(), "Draining in-flight messages");

    let drained = tokio::time::timeout(timeout, async {
        while let Some(joined) = tasks.join_next().await {
            reap(route, joined);
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            route = %route,
            abandoned = tasks.len(),
            "Drain timed out, aborting in-flight messages"
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

/// Acquire the route's producer and attach it to the outbox.
///
/// Whatever producer is acquired ends up either attached or released; a
/// cancel only interrupts the wait for one.
async fn acquire_producer(
    broker: Arc<dyn Broker>,
    outbox: Arc<Outbox>,
    mut cancel: oneshot::Receiver<()>,
) {
    let acquired = tokio::select! {
        biased;

        _ = &mut cancel => {
            debug!(route = %outbox.route, "Producer acquisition cancelled");
            return;
        }

        acquired = broker.producer() => acquired,
    };

    match acquired {
        Ok(producer) => match outbox.attach(producer).await {
            Ok(flushed) => {
                info!(route = %outbox.route, topic = %outbox.topic, flushed, "Producer ready");
            }
            Err(producer) => {
                debug!(route = %outbox.route, "Outbox closed before producer attached");
                if let Err(e) = producer.disconnect().await {
                    warn!(route = %outbox.route, error = %e, "Failed to release unused producer");
                }
            }
        },
        Err(e) => {
            error!(
                route = %outbox.route,
                stage = %StageName::Publish,
                topic = %outbox.topic,
                error = %e,
                "Failed to acquire producer, outputs will be dropped"
            );
            outbox.fail().await;
        }
    }
}

impl<C, P, O> StreamRoute<C, P, O>
where
    C: Send + 'static,
    P: Send + 'static,
    O: Encode + Send + 'static,
{
    async fn attach(&self, ctx: &mut BindContext<'_>) -> Result<BoundStreamRoute, RouteError> {
        let id = self.descriptor.id();
        for (which, topic) in [("input", &self.input_topic), ("output", &self.output_topic)] {
            if topic.trim().is_empty() {
                return Err(RouteError::MalformedDescriptor {
                    route: id.to_string(),
                    reason: format!("{which} topic cannot be empty"),
                });
            }
        }
        let transport = |source: TransportError| RouteError::Transport {
            route: id.to_string(),
            source,
        };

        let mut admin = ctx.broker.admin().await.map_err(transport)?;
        let consumer = match ctx
            .broker
            .consumer(&ctx.stream.group_id, &self.input_topic, ctx.stream.start)
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                if let Err(release) = admin.disconnect().await {
                    warn!(route = %id, error = %release, "Failed to release admin handle");
                }
                return Err(transport(e));
            }
        };
        info!(
            "Subscribed to {} (group {}) for route {}",
            self.input_topic, ctx.stream.group_id, id
        );

        let outbox = Arc::new(Outbox::new(
            id,
            self.output_topic.as_str(),
            ctx.stream.pending_output_capacity,
        ));
        let pipeline = Arc::new(StreamPipeline {
            route: id.to_string(),
            consume: Arc::clone(&self.consume),
            process: Arc::clone(&self.process),
            produce: Arc::clone(&self.produce),
            outbox: Arc::clone(&outbox),
        });

        let (stop, stopped) = oneshot::channel();
        let consumer_loop = tokio::spawn(consume_loop(consumer, pipeline, stopped));
        let (producer_cancel, cancelled) = oneshot::channel();
        let producer_task = tokio::spawn(acquire_producer(
            Arc::clone(&ctx.broker),
            Arc::clone(&outbox),
            cancelled,
        ));

        Ok(BoundStreamRoute {
            id: id.to_string(),
            input_topic: self.input_topic.clone(),
            admin: Some(admin),
            stop: Some(stop),
            consumer_loop: Some(consumer_loop),
            producer_cancel: Some(producer_cancel),
            producer_task: Some(producer_task),
            outbox,
            drain_timeout: ctx.stream.drain_timeout,
        })
    }
}

#[async_trait]
impl<C, P, O> Route for StreamRoute<C, P, O>
where
    C: Send + 'static,
    P: Send + 'static,
    O: Encode + Send + 'static,
{
    fn descriptor(&self) -> &RouteDescriptor {
        &self.descriptor
    }

    async fn bind(&self, ctx: &mut BindContext<'_>) -> Result<Box<dyn BoundRoute>, RouteError> {
        if self.bound.swap(true, Ordering::AcqRel) {
            return Err(RouteError::RouteAlreadyBound(self.descriptor.id().to_string()));
        }
        match self.attach(ctx).await {
            Ok(bound) => Ok(Box::new(bound)),
            Err(e) => {
                self.bound.store(false, Ordering::Release);
                Err(e)
            }
        }
    }
}

type ConsumerLoop = JoinHandle<(Box<dyn ConsumerHandle>, JoinSet<()>)>;

/// A live stream route. Owns its admin, consumer and producer handles.
struct BoundStreamRoute {
    id: String,
    input_topic: String,
    admin: Option<Box<dyn AdminHandle>>,
    stop: Option<oneshot::Sender<()>>,
    consumer_loop: Option<ConsumerLoop>,
    producer_cancel: Option<oneshot::Sender<()>>,
    producer_task: Option<JoinHandle<()>>,
    outbox: Arc<Outbox>,
    drain_timeout: Duration,
}

impl BoundStreamRoute {
    fn record_failure(
        &self,
        failures: &mut Vec<(&'static str, TransportError)>,
        handle: &'static str,
        result: Result<(), TransportError>,
    ) {
        if let Err(e) = result {
            error!(route = %self.id, handle, error = %e, "Failed to disconnect {}", handle);
            failures.push((handle, e));
        }
    }
}

#[async_trait]
impl BoundRoute for BoundStreamRoute {
    fn id(&self) -> &str {
        &self.id
    }

    async fn unbind(&mut self) -> Result<(), UnbindError> {
        let mut failures = Vec::new();

        // Stop receiving, then let in-flight records publish before the
        // outbox closes.
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let mut consumer = None;
        if let Some(handle) = self.consumer_loop.take() {
            match handle.await {
                Ok((handle, mut tasks)) => {
                    drain(&self.id, &mut tasks, self.drain_timeout).await;
                    consumer = Some(handle);
                }
                Err(e) => {
                    let e = TransportError::Other(format!("consumer loop failed: {e}"));
                    self.record_failure(&mut failures, "consumer", Err(e));
                }
            }
        }
        if let Some(cancel) = self.producer_cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(task) = self.producer_task.take() {
            if let Err(e) = task.await {
                warn!(route = %self.id, error = %e, "Producer task failed");
            }
        }
        let producer = self.outbox.close().await;

        if let Some(mut admin) = self.admin.take() {
            let result = admin.disconnect().await;
            self.record_failure(&mut failures, "admin", result);
        }
        if let Some(mut consumer) = consumer {
            let result = consumer.disconnect().await;
            self.record_failure(&mut failures, "consumer", result);
        }
        if let Some(producer) = producer {
            let result = producer.disconnect().await;
            self.record_failure(&mut failures, "producer", result);
        }

        if failures.is_empty() {
            info!("Unsubscribed from {} for route {}", self.input_topic, self.id);
            Ok(())
        } else {
            Err(UnbindError {
                route: self.id.clone(),
                failures,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::StreamSettings;
    use orbit_transport::{HttpDispatch, MemoryBroker, StartOffset};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingProducer {
        sent: StdMutex<Vec<(String, Bytes)>>,
        disconnects: AtomicUsize,
    }

    #[async_trait]
    impl ProducerHandle for RecordingProducer {
        async fn send(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Hands out one shared producer, or never answers when `hold` is set.
    struct ProducerBroker {
        producer: Arc<RecordingProducer>,
        hold: bool,
    }

    #[async_trait]
    impl Broker for ProducerBroker {
        async fn connect(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn admin(&self) -> Result<Box<dyn AdminHandle>, TransportError> {
            Err(TransportError::Other("no admin".into()))
        }

        async fn consumer(
            &self,
            _group_id: &str,
            _topic: &str,
            _start: StartOffset,
        ) -> Result<Box<dyn ConsumerHandle>, TransportError> {
            Err(TransportError::Other("no consumer".into()))
        }

        async fn producer(&self) -> Result<Arc<dyn ProducerHandle>, TransportError> {
            if self.hold {
                std::future::pending::<()>().await;
            }
            Ok(Arc::clone(&self.producer) as Arc<dyn ProducerHandle>)
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "producer-only"
        }
    }

    impl RecordingProducer {
        fn payloads(&self) -> Vec<Bytes> {
            self.sent.lock().unwrap().iter().map(|(_, p)| p.clone()).collect()
        }
    }

    fn notify_worker() -> StreamRoute<String, String, String> {
        StreamRoute::builder("NOTIFY_WORKER", "in", "out")
            .consume(|record: Record| async move { Ok::<_, BoxError>(record.value_lossy()) })
            .process(|x: String| async move { Ok::<_, BoxError>(x) })
            .produce(|x: String| async move { Ok::<_, BoxError>(format!("Worker notified: {x}")) })
    }

    async fn wait_for_records(broker: &MemoryBroker, topic: &str, count: usize) -> Vec<Record> {
        for _ in 0..200 {
            let records = broker.records(topic);
            if records.len() >= count {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        broker.records(topic)
    }

    #[tokio::test]
    async fn test_outbox_buffers_until_attached() {
        let outbox = Outbox::new("R", "out", 8);
        assert_eq!(outbox.publish(Bytes::from("a")).await.unwrap(), Delivery::Buffered);
        assert_eq!(outbox.publish(Bytes::from("b")).await.unwrap(), Delivery::Buffered);
        assert_eq!(outbox.pending().await, 2);

        let producer = Arc::new(RecordingProducer::default());
        let flushed = outbox.attach(producer.clone()).await.ok().unwrap();
        assert_eq!(flushed, 2);

        assert_eq!(outbox.publish(Bytes::from("c")).await.unwrap(), Delivery::Sent);
        assert_eq!(
            producer.payloads(),
            vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]
        );
        assert!(producer.sent.lock().unwrap().iter().all(|(t, _)| t == "out"));
    }

    #[tokio::test]
    async fn test_outbox_drops_oldest_when_full() {
        let outbox = Outbox::new("R", "out", 2);
        for payload in ["a", "b", "c"] {
            outbox.publish(Bytes::from(payload)).await.unwrap();
        }
        assert_eq!(outbox.pending().await, 2);

        let producer = Arc::new(RecordingProducer::default());
        outbox.attach(producer.clone()).await.ok().unwrap();
        assert_eq!(producer.payloads(), vec![Bytes::from("b"), Bytes::from("c")]);
    }

    #[tokio::test]
    async fn test_outbox_zero_capacity_discards() {
        let outbox = Outbox::new("R", "out", 0);
        assert_eq!(outbox.publish(Bytes::from("a")).await.unwrap(), Delivery::Discarded);
        assert_eq!(outbox.pending().await, 0);
    }

    #[tokio::test]
    async fn test_outbox_failed_and_closed() {
        let failed = Outbox::new("R", "out", 4);
        failed.publish(Bytes::from("a")).await.unwrap();
        failed.fail().await;
        assert_eq!(failed.publish(Bytes::from("b")).await.unwrap(), Delivery::Discarded);

        let closed = Outbox::new("R", "out", 4);
        let producer: Arc<dyn ProducerHandle> = Arc::new(RecordingProducer::default());
        closed.attach(Arc::clone(&producer)).await.ok().unwrap();
        assert!(closed.close().await.is_some());
        assert_eq!(closed.publish(Bytes::from("c")).await.unwrap(), Delivery::Discarded);
        // Attaching after close hands the producer back.
        assert!(closed.attach(producer).await.is_err());
    }

    #[tokio::test]
    async fn test_producer_acquired_after_close_is_released() {
        let producer = Arc::new(RecordingProducer::default());
        let broker = Arc::new(ProducerBroker {
            producer: Arc::clone(&producer),
            hold: false,
        });
        let outbox = Arc::new(Outbox::new("R", "out", 4));
        assert!(outbox.close().await.is_none());

        let (_cancel, cancelled) = oneshot::channel();
        acquire_producer(broker, Arc::clone(&outbox), cancelled).await;

        assert_eq!(producer.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(outbox.publish(Bytes::from("late")).await.unwrap(), Delivery::Discarded);
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting_for_producer() {
        let producer = Arc::new(RecordingProducer::default());
        let broker = Arc::new(ProducerBroker {
            producer: Arc::clone(&producer),
            hold: true,
        });
        let outbox = Arc::new(Outbox::new("R", "out", 4));

        let (cancel, cancelled) = oneshot::channel();
        let task = tokio::spawn(acquire_producer(broker, Arc::clone(&outbox), cancelled));
        cancel.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(producer.disconnects.load(Ordering::SeqCst), 0);
        assert!(outbox.close().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_route_end_to_end() {
        let broker = MemoryBroker::new();
        broker.connect().await.unwrap();
        let route = notify_worker();
        let mut http = HttpDispatch::new();
        let mut ctx = BindContext {
            http: &mut http,
            broker: Arc::new(broker.clone()),
            stream: StreamSettings::default(),
        };

        let mut bound = route.bind(&mut ctx).await.unwrap();
        assert_eq!(bound.id(), "NOTIFY_WORKER");
        broker.publish("in", "hello").unwrap();

        let out = wait_for_records(&broker, "out", 1).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value_lossy(), "Worker notified: hello");

        bound.unbind().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_message_is_dropped_and_loop_continues() {
        let broker = MemoryBroker::new();
        broker.connect().await.unwrap();
        let route = StreamRoute::builder("PARSE", "numbers", "doubled")
            .consume(|record: Record| async move { record.value_lossy().parse::<u64>() })
            .process(|n: u64| async move { Ok::<_, BoxError>(n * 2) })
            .produce(|n: u64| async move { Ok::<_, BoxError>(n.to_string()) });
        let mut http = HttpDispatch::new();
        let mut ctx = BindContext {
            http: &mut http,
            broker: Arc::new(broker.clone()),
            stream: StreamSettings::default(),
        };
        let mut bound = route.bind(&mut ctx).await.unwrap();

        broker.publish("numbers", "not a number").unwrap();
        broker.publish("numbers", "21").unwrap();

        let out = wait_for_records(&broker, "doubled", 1).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value_lossy(), "42");

        bound.unbind().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_twice_and_rebind_after_failure() {
        let broker = MemoryBroker::new();
        let route = notify_worker();
        let mut http = HttpDispatch::new();
        let mut ctx = BindContext {
            http: &mut http,
            broker: Arc::new(broker.clone()),
            stream: StreamSettings::default(),
        };

        // Not connected yet: the admin handle cannot be acquired.
        let first = route.bind(&mut ctx).await;
        assert!(matches!(first, Err(RouteError::Transport { .. })));

        broker.connect().await.unwrap();
        let mut bound = route.bind(&mut ctx).await.unwrap();
        assert!(matches!(
            route.bind(&mut ctx).await,
            Err(RouteError::RouteAlreadyBound(_))
        ));
        bound.unbind().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_topic_is_malformed() {
        let broker = MemoryBroker::new();
        broker.connect().await.unwrap();
        let route = StreamRoute::builder("BAD", "in", " ")
            .consume(|record: Record| async move { Ok::<_, BoxError>(record.value) })
            .process(|b: Bytes| async move { Ok::<_, BoxError>(b) })
            .produce(|b: Bytes| async move { Ok::<_, BoxError>(b) });
        let mut http = HttpDispatch::new();
        let mut ctx = BindContext {
            http: &mut http,
            broker: Arc::new(broker),
            stream: StreamSettings::default(),
        };
        assert!(matches!(
            route.bind(&mut ctx).await,
            Err(RouteError::MalformedDescriptor { .. })
        ));
    }
}
