//! Scripted in-memory broker implementing the connector traits.
//!
//! Every broker operation is appended to a journal together with the
//! (virtual) time it happened, so tests can assert ordering and pauses.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::{ExchangeSpec, QueueFlags};
use crate::connector::{
    BrokerChannel, BrokerConnection, Connector, MessageProperties, Pull, RawDelivery,
};
use crate::utils::error::{InboundError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Open(u64),
    OpenRefused,
    OpenStalled,
    CreateChannel(u64),
    QueueDeclare { queue: String, passive: bool },
    ExchangeDeclare { exchange: String, passive: bool },
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    Qos(u16),
    Consume {
        queue: String,
        consumer_tag: String,
        auto_ack: bool,
    },
    ConsumeStalled,
    Pull,
    Deliver(u64),
    TxSelect,
    Ack(u64),
    Commit,
    Rollback,
    Recover,
    CloseChannel(u64),
    CloseConnection(u64),
}

#[derive(Debug, Clone, Default)]
pub struct FakeMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub redelivered: bool,
}

impl FakeMessage {
    pub fn text(body: &str) -> Self {
        Self {
            body: body.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    pub fn with_message_id(mut self, id: &str) -> Self {
        self.properties.message_id = Some(id.to_string());
        self
    }
}

#[derive(Debug)]
struct InFlight {
    channel: u64,
    tag: u64,
    acked: bool,
    message: FakeMessage,
}

#[derive(Debug, Default)]
struct ChannelInfo {
    connection: u64,
    next_tag: u64,
    tx: bool,
    auto_ack: bool,
    consuming: bool,
    closed: bool,
}

#[derive(Debug, Default)]
struct State {
    journal: Vec<(Instant, Op)>,
    queues: HashSet<String>,
    exchanges: HashSet<String>,
    ready: VecDeque<FakeMessage>,
    in_flight: Vec<InFlight>,
    unreachable: bool,
    refuse_opens: u32,
    fail_binds: bool,
    fail_acks: u32,
    stall_opens: bool,
    stall_consumes: bool,
    next_id: u64,
    open_connections: HashSet<u64>,
    channels: HashMap<u64, ChannelInfo>,
}

impl State {
    fn record(&mut self, op: Op) {
        self.journal.push((Instant::now(), op));
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_usable(&self, id: u64) -> bool {
        self.channels
            .get(&id)
            .is_some_and(|c| !c.closed && self.open_connections.contains(&c.connection))
    }

    fn requeue(&mut self, keep: impl Fn(&InFlight) -> bool) {
        let (requeued, kept): (Vec<_>, Vec<_>) =
            self.in_flight.drain(..).partition(|f| !keep(f));
        self.in_flight = kept;
        for flight in requeued.into_iter().rev() {
            let mut message = flight.message;
            message.redelivered = true;
            self.ready.push_front(message);
        }
    }
}

/// Handle on the shared broker state. Cheap to clone.
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<State>>,
    wake: Arc<Notify>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            broker: self.clone(),
        }
    }

    pub fn with_queue(self, queue: &str) -> Self {
        self.lock().queues.insert(queue.to_string());
        self
    }

    pub fn with_exchange(self, exchange: &str) -> Self {
        self.lock().exchanges.insert(exchange.to_string());
        self
    }

    pub fn publish(&self, message: FakeMessage) {
        self.lock().ready.push_back(message);
        self.wake.notify_waiters();
    }

    /// Refuses the next `n` connection attempts.
    pub fn refuse_opens(&self, n: u32) {
        self.lock().refuse_opens = n;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    pub fn fail_binds(&self) {
        self.lock().fail_binds = true;
    }

    /// Fails the next `n` acknowledgements while the channel stays open.
    pub fn fail_acks(&self, n: u32) {
        self.lock().fail_acks = n;
    }

    /// Connection attempts from now on never complete.
    pub fn stall_opens(&self) {
        self.lock().stall_opens = true;
    }

    /// `basic_consume` calls from now on never complete.
    pub fn stall_consumes(&self) {
        self.lock().stall_consumes = true;
    }

    /// Severs every open connection, as a broker restart would.
    pub fn drop_connections(&self) {
        {
            let mut st = self.lock();
            st.open_connections.clear();
            st.requeue(|_| false);
        }
        self.wake.notify_waiters();
    }

    /// Cancels every subscription while leaving channels open.
    pub fn cancel_consumers(&self) {
        for channel in self.lock().channels.values_mut() {
            channel.consuming = false;
        }
        self.wake.notify_waiters();
    }

    pub fn journal(&self) -> Vec<Op> {
        self.lock().journal.iter().map(|(_, op)| op.clone()).collect()
    }

    pub fn timed_journal(&self) -> Vec<(Instant, Op)> {
        self.lock().journal.clone()
    }

    pub fn count(&self, pred: impl Fn(&Op) -> bool) -> usize {
        self.lock().journal.iter().filter(|(_, op)| pred(op)).count()
    }

    pub fn ready_len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().open_connections.len()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains(queue)
    }
}

#[derive(Clone)]
pub struct FakeConnector {
    broker: FakeBroker,
}

#[async_trait]
impl Connector for FakeConnector {
    type Connection = FakeConnection;

    async fn open(&self) -> Result<FakeConnection> {
        let stalled = {
            let mut st = self.broker.lock();
            if st.stall_opens {
                st.record(Op::OpenStalled);
            }
            st.stall_opens
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        let mut st = self.broker.lock();
        if st.unreachable || st.refuse_opens > 0 {
            st.refuse_opens = st.refuse_opens.saturating_sub(1);
            st.record(Op::OpenRefused);
            return Err(InboundError::connection("connection refused"));
        }
        let id = st.next_id();
        st.open_connections.insert(id);
        st.record(Op::Open(id));
        Ok(FakeConnection {
            id,
            broker: self.broker.clone(),
        })
    }
}

pub struct FakeConnection {
    id: u64,
    broker: FakeBroker,
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    type Channel = FakeChannel;

    fn is_open(&self) -> bool {
        self.broker.lock().open_connections.contains(&self.id)
    }

    async fn create_channel(&self) -> Result<FakeChannel> {
        let mut st = self.broker.lock();
        if !st.open_connections.contains(&self.id) {
            return Err(InboundError::topology("connection is closed"));
        }
        let id = st.next_id();
        st.channels.insert(
            id,
            ChannelInfo {
                connection: self.id,
                next_tag: 1,
                ..Default::default()
            },
        );
        st.record(Op::CreateChannel(id));
        Ok(FakeChannel {
            id,
            broker: self.broker.clone(),
        })
    }

    async fn close(&self) -> Result<()> {
        {
            let mut st = self.broker.lock();
            if !st.open_connections.remove(&self.id) {
                return Ok(());
            }
            st.record(Op::CloseConnection(self.id));
            let channels: HashSet<u64> = st
                .channels
                .iter()
                .filter(|(_, c)| c.connection == self.id)
                .map(|(id, _)| *id)
                .collect();
            st.requeue(|f| !channels.contains(&f.channel));
        }
        self.broker.wake.notify_waiters();
        Ok(())
    }
}

pub struct FakeChannel {
    id: u64,
    broker: FakeBroker,
}

impl FakeChannel {
    fn usable(&self, st: &State) -> Result<()> {
        if st.channel_usable(self.id) {
            Ok(())
        } else {
            Err(InboundError::channel("channel is closed"))
        }
    }

    fn try_pull(&self) -> Option<Pull> {
        let mut st = self.broker.lock();
        if !st.channel_usable(self.id) {
            return Some(Pull::Disconnected("connection reset by broker".into()));
        }
        let info = st.channels.get(&self.id)?;
        if !info.consuming {
            return Some(Pull::Cancelled);
        }
        let auto_ack = info.auto_ack;
        let message = st.ready.pop_front()?;
        let info = st.channels.get_mut(&self.id)?;
        let tag = info.next_tag;
        info.next_tag += 1;
        st.record(Op::Deliver(tag));
        let raw = RawDelivery {
            delivery_tag: tag,
            redelivered: message.redelivered,
            exchange: String::new(),
            routing_key: String::new(),
            body: message.body.clone(),
            properties: message.properties.clone(),
        };
        if !auto_ack {
            st.in_flight.push(InFlight {
                channel: self.id,
                tag,
                acked: false,
                message,
            });
        }
        Some(Pull::Delivery(raw))
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    fn is_open(&self) -> bool {
        self.broker.lock().channel_usable(self.id)
    }

    async fn queue_declare(&self, queue: &str, _flags: QueueFlags, passive: bool) -> Result<()> {
        let mut st = self.broker.lock();
        self.usable(&st)?;
        st.record(Op::QueueDeclare {
            queue: queue.to_string(),
            passive,
        });
        if passive && !st.queues.contains(queue) {
            if let Some(info) = st.channels.get_mut(&self.id) {
                info.closed = true;
            }
            return Err(InboundError::topology(format!("NOT_FOUND - no queue '{queue}'")));
        }
        st.queues.insert(queue.to_string());
        Ok(())
    }

    async fn exchange_declare(&self, exchange: &ExchangeSpec, passive: bool) -> Result<()> {
        let mut st = self.broker.lock();
        self.usable(&st)?;
        st.record(Op::ExchangeDeclare {
            exchange: exchange.name.clone(),
            passive,
        });
        if passive && !st.exchanges.contains(&exchange.name) {
            if let Some(info) = st.channels.get_mut(&self.id) {
                info.closed = true;
            }
            return Err(InboundError::topology(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange.name
            )));
        }
        st.exchanges.insert(exchange.name.clone());
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut st = self.broker.lock();
        self.usable(&st)?;
        if st.fail_binds {
            return Err(InboundError::topology("bind refused"));
        }
        st.record(Op::QueueBind {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        let mut st = self.broker.lock();
        self.usable(&st)?;
        st.record(Op::Qos(prefetch_count));
        Ok(())
    }

    async fn basic_consume(
        &mut self,
        queue: &str,
        consumer_tag: Option<&str>,
        auto_ack: bool,
    ) -> Result<String> {
        let stalled = {
            let mut st = self.broker.lock();
            self.usable(&st)?;
            if st.stall_consumes {
                st.record(Op::ConsumeStalled);
            }
            st.stall_consumes
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        let mut st = self.broker.lock();
        self.usable(&st)?;
        let tag = consumer_tag
            .map(str::to_string)
            .unwrap_or_else(|| format!("amq.ctag-{}", self.id));
        if let Some(info) = st.channels.get_mut(&self.id) {
            info.consuming = true;
            info.auto_ack = auto_ack;
        }
        st.record(Op::Consume {
            queue: queue.to_string(),
            consumer_tag: tag.clone(),
            auto_ack,
        });
        Ok(tag)
    }

    async fn next_delivery(&mut self) -> Pull {
        self.broker.lock().record(Op::Pull);
        loop {
            let wake = self.broker.wake.notified();
            tokio::pin!(wake);
            wake.as_mut().enable();
            if let Some(pull) = self.try_pull() {
                return pull;
            }
            wake.await;
        }
    }

    async fn tx_select(&self) -> Result<()> {
        let mut st = self.broker.lock();
        self.usable(&st)?;
        if let Some(info) = st.channels.get_mut(&self.id) {
            info.tx = true;
        }
        st.record(Op::TxSelect);
        Ok(())
    }

    async fn tx_commit(&self) -> Result<()> {
        let mut st = self.broker.lock();
        self.usable(&st)?;
        let id = self.id;
        st.in_flight.retain(|f| !(f.channel == id && f.acked));
        st.record(Op::Commit);
        Ok(())
    }

    async fn tx_rollback(&self) -> Result<()> {
        let mut st = self.broker.lock();
        self.usable(&st)?;
        let id = self.id;
        for flight in st.in_flight.iter_mut().filter(|f| f.channel == id) {
            flight.acked = false;
        }
        st.record(Op::Rollback);
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        let mut st = self.broker.lock();
        self.usable(&st)?;
        if st.fail_acks > 0 {
            st.fail_acks -= 1;
            return Err(InboundError::channel("PRECONDITION_FAILED - unknown delivery tag"));
        }
        let id = self.id;
        let tx = st.channels.get(&id).is_some_and(|c| c.tx);
        if tx {
            for flight in st
                .in_flight
                .iter_mut()
                .filter(|f| f.channel == id && f.tag == delivery_tag)
            {
                flight.acked = true;
            }
        } else {
            st.in_flight
                .retain(|f| !(f.channel == id && f.tag == delivery_tag));
        }
        st.record(Op::Ack(delivery_tag));
        Ok(())
    }

    async fn basic_recover(&self) -> Result<()> {
        {
            let mut st = self.broker.lock();
            self.usable(&st)?;
            let id = self.id;
            st.requeue(|f| f.channel != id);
            st.record(Op::Recover);
        }
        self.broker.wake.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut st = self.broker.lock();
        if let Some(info) = st.channels.get_mut(&self.id) {
            if info.closed {
                return Ok(());
            }
            info.closed = true;
        }
        st.record(Op::CloseChannel(self.id));
        Ok(())
    }
}
