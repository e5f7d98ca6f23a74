// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests.
//!
//! Topology operations are appended to a log shared by every connection of a
//! connector, in the order they reached the "broker".

use crate::{
    errors::AmqpError,
    exchange::ExchangeKind,
    transport::{
        BrokerChannel, BrokerConnection, ConnectionEvent, Connector, Delivery, DeliveryStream,
        Publishing,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{BasicConsumeOptions, ExchangeDeclareOptions, QueueDeclareOptions},
    types::FieldTable,
};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, watch};

type Log = Arc<Mutex<Vec<String>>>;

/// Polls `condition` until it holds, panicking after two seconds.
pub(crate) async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);

    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Default)]
pub(crate) struct FakeConnector {
    log: Log,
    failing_dials: AtomicU32,
    failing_opens: AtomicU32,
    dials: AtomicU32,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(FakeConnector::default())
    }

    /// Makes the next `count` dials fail.
    pub(crate) fn fail_next_dials(&self, count: u32) {
        self.failing_dials.store(count, Ordering::SeqCst);
    }

    /// Makes the next dialed connection refuse its first `count` channels.
    pub(crate) fn fail_next_channel_opens(&self, count: u32) {
        self.failing_opens.store(count, Ordering::SeqCst);
    }

    pub(crate) fn dials(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }

    pub(crate) fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.connections.lock().clone()
    }

    pub(crate) fn last_connection(&self) -> Arc<FakeConnection> {
        self.connections
            .lock()
            .last()
            .cloned()
            .expect("no connection was dialed")
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub(crate) fn clear_log(&self) {
        self.log.lock().clear();
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn dial(&self, _uri: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        self.dials.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failing_dials
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        let connection = FakeConnection::new(self.log.clone());
        connection.fail_next_opens(self.failing_opens.swap(0, Ordering::SeqCst));
        self.connections.lock().push(connection.clone());
        Ok(connection)
    }
}

pub(crate) struct FakeConnection {
    log: Log,
    events_tx: mpsc::Sender<ConnectionEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ConnectionEvent>>>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
    failing_opens: AtomicU32,
    closed: AtomicBool,
}

impl FakeConnection {
    fn new(log: Log) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(16);

        Arc::new(FakeConnection {
            log,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            channels: Mutex::new(vec![]),
            failing_opens: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn fail_next_opens(&self, count: u32) {
        self.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Channels opened so far, in order; the first one is the control channel.
    pub(crate) fn channels(&self) -> Vec<Arc<FakeChannel>> {
        self.channels.lock().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Simulates the broker dropping the connection.
    pub(crate) fn drop_connection(&self, reason: &str) {
        self.shut(reason);
        let _ = self.events_tx.try_send(ConnectionEvent::Closed(
            AmqpError::ConnectionClosed(reason.to_owned()),
        ));
    }

    pub(crate) fn block(&self, reason: &str) {
        let _ = self
            .events_tx
            .try_send(ConnectionEvent::Blocked(reason.to_owned()));
    }

    fn shut(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        for channel in self.channels.lock().iter() {
            channel.fail(reason);
        }
    }
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }

        let failing = self
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AmqpError::ChannelError("channel limit reached".to_owned()));
        }

        let channel = FakeChannel::with_log(self.log.clone());
        self.channels.lock().push(channel.clone());
        Ok(channel)
    }

    fn notifications(&self) -> Option<mpsc::Receiver<ConnectionEvent>> {
        self.events_rx.lock().take()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.shut("closed by client");
        Ok(())
    }
}

#[derive(Default)]
struct ChannelState {
    consumers: Vec<mpsc::UnboundedSender<Result<Delivery, AmqpError>>>,
    published: Vec<(String, String, Publishing)>,
    prefetch: Option<u16>,
    fail_qos: bool,
    fail_consume: bool,
    generated_names: u32,
}

pub(crate) struct FakeChannel {
    log: Log,
    state: Mutex<ChannelState>,
    closed: watch::Sender<Option<AmqpError>>,
}

impl FakeChannel {
    pub(crate) fn new() -> Arc<Self> {
        FakeChannel::with_log(Log::default())
    }

    fn with_log(log: Log) -> Arc<Self> {
        let (closed, _) = watch::channel(None);

        Arc::new(FakeChannel {
            log,
            state: Mutex::new(ChannelState::default()),
            closed,
        })
    }

    pub(crate) fn fail_qos(&self) {
        self.state.lock().fail_qos = true;
    }

    pub(crate) fn fail_consume(&self) {
        self.state.lock().fail_consume = true;
    }

    pub(crate) fn prefetch(&self) -> Option<u16> {
        self.state.lock().prefetch
    }

    pub(crate) fn consumers(&self) -> usize {
        self.state.lock().consumers.len()
    }

    pub(crate) async fn wait_for_consumers(&self, count: usize) {
        eventually("consumers", || self.consumers() >= count).await;
    }

    pub(crate) fn published(&self) -> Vec<(String, String, Publishing)> {
        self.state.lock().published.clone()
    }

    /// Pushes a delivery to the first consumer started on this channel.
    pub(crate) fn deliver(&self, body: &[u8]) {
        let state = self.state.lock();
        let consumer = state.consumers.first().expect("no consumer on channel");
        consumer
            .send(Ok(Delivery::new(body.to_vec())))
            .expect("consumer stream dropped");
    }

    /// Simulates the broker closing the channel.
    pub(crate) fn fail(&self, reason: &str) {
        self.state.lock().consumers.clear();
        self.closed
            .send_replace(Some(AmqpError::ChannelError(reason.to_owned())));
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    fn ensure_open(&self) -> Result<(), AmqpError> {
        match &*self.closed.borrow() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn queue_declare(
        &self,
        name: &str,
        _options: QueueDeclareOptions,
        _arguments: FieldTable,
    ) -> Result<String, AmqpError> {
        self.ensure_open()?;
        self.log.lock().push(format!("queue.declare {name}"));

        if !name.is_empty() {
            return Ok(name.to_owned());
        }

        let mut state = self.state.lock();
        state.generated_names += 1;
        Ok(format!("amq.gen-{}", state.generated_names))
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        _options: ExchangeDeclareOptions,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.log.lock().push(format!("exchange.declare {name} {kind}"));
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        _routing_key: &str,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.log.lock().push(format!("queue.bind {queue} {exchange}"));
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16, _global: bool) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if state.fail_qos {
            return Err(AmqpError::ChannelError("qos refused".to_owned()));
        }
        state.prefetch = Some(prefetch_count);
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        _options: BasicConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if state.fail_consume {
            return Err(AmqpError::ChannelError(format!("NOT_FOUND - no queue '{queue}'")));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.consumers.push(tx);

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: &Publishing,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.state.lock().published.push((
            exchange.to_owned(),
            routing_key.to_owned(),
            publishing.clone(),
        ));
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.fail("closed by client");
        Ok(())
    }

    async fn closed(&self) -> AmqpError {
        let mut rx = self.closed.subscribe();
        let reason = rx.wait_for(|state| state.is_some()).await.map(|state| state.clone());

        match reason {
            Ok(Some(err)) => err,
            _ => AmqpError::ChannelError("channel closed".to_owned()),
        }
    }
}
