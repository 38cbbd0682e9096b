use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use pipes_utils::Counter;

use crate::context::{Context, ListenerId};
use crate::error::PipeError;
use crate::message::Message;
use crate::subscription::Subscription;

/// Decides whether a registration is interested in a message.
pub trait Filter: Send + Sync {
    fn filter(&self, msg: &Message) -> Result<bool, PipeError>;

    /// Source text shown by `describe`.
    fn source(&self) -> &str;
}

/// Picks the subscriptions a message goes to and whether it may be delivered now.
pub trait Route: Send + Sync {
    fn route(&self, subs: &[Arc<Subscription>], msg: &Message) -> Result<Decision, PipeError>;

    fn source(&self) -> &str;
}

#[derive(Default)]
pub struct Decision {
    pub subs: Vec<Arc<Subscription>>,
    pub ready: bool,
}

struct Pending {
    seq: u64,
    msg: Arc<Message>,
    //Present for two-way messages, whose entry must go when the caller goes.
    cleanup: Option<(Context, ListenerId)>,
}

impl Pending {
    #[inline]
    fn release(&self) {
        if let Some((ctx, id)) = &self.cleanup {
            ctx.off_finalize(*id);
        }
    }
}

struct Attached {
    sub: Arc<Subscription>,
    listener: ListenerId,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Pending>,
    subs: BTreeMap<u64, Attached>,
}

/// A filter and router pair with a bounded pending queue and its attached subscriptions.
///
/// Queue and subscription set share one lock. Filters, routers and forward callbacks are
/// always invoked with that lock released.
pub struct Registration {
    id: String,
    tag: String,
    filter: Box<dyn Filter>,
    router: Box<dyn Route>,
    max_queue: usize,
    builtin: bool,
    state: Mutex<State>,
    pump_lock: Mutex<()>,
    pump_pending: AtomicBool,
    seq: AtomicU64,
    accepted: Counter,
    dropped: Counter,
}

impl Registration {
    pub fn new<I, T>(id: I, tag: T, filter: Box<dyn Filter>, router: Box<dyn Route>, max_queue: usize) -> Self
    where
        I: Into<String>,
        T: Into<String>,
    {
        Registration {
            id: id.into(),
            tag: tag.into(),
            filter,
            router,
            max_queue: max_queue.max(1),
            builtin: false,
            state: Mutex::new(State::default()),
            pump_lock: Mutex::new(()),
            pump_pending: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            accepted: Counter::new(),
            dropped: Counter::new(),
        }
    }

    /// Built-in registrations never queue, and only count as a match when they deliver.
    pub fn builtin(mut self) -> Self {
        self.builtin = true;
        self
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    #[inline]
    pub fn is_builtin(&self) -> bool {
        self.builtin
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    #[inline]
    pub fn accepted(&self) -> u64 {
        self.accepted.count()
    }

    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped.count()
    }

    /// Failing filters reject the message.
    pub fn filter(&self, msg: &Message) -> bool {
        match self.filter.filter(msg) {
            Ok(matched) => matched,
            Err(e) => {
                log::warn!("{} filter failed on {}, {}", self.id, msg, e);
                false
            }
        }
    }

    /// Failing routers leave the message queued.
    pub fn decide(&self, subs: &[Arc<Subscription>], msg: &Message) -> Decision {
        match self.router.route(subs, msg) {
            Ok(d) => d,
            Err(e) => {
                log::warn!("{} router failed on {}, {}", self.id, msg, e);
                Decision::default()
            }
        }
    }

    /// Offers `msg` to this registration. Returns whether it was taken.
    pub fn forward(self: &Arc<Self>, ctx: &Context, msg: Arc<Message>) -> bool {
        if !self.filter(&msg) {
            return false;
        }
        if self.builtin {
            let decision = self.decide(&self.subscriptions(), &msg);
            if !decision.ready || decision.subs.is_empty() {
                return false;
            }
            self.accepted.inc();
            Self::deliver(&decision.subs, msg);
            return true;
        }
        self.enqueue(ctx, msg);
        self.pump();
        true
    }

    /// Appends `msg` to the pending queue, evicting the oldest entries past `max_queue`.
    pub fn enqueue(self: &Arc<Self>, ctx: &Context, msg: Arc<Message>) {
        self.accepted.inc();

        let evicted = {
            let mut state = self.state.lock();
            //Allocated under the lock, the queue stays ordered by seq.
            let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
            let cleanup = if msg.typ.is_twoway() {
                let weak = Arc::downgrade(self);
                let listener = ctx.on_finalize(move |_| {
                    if let Some(reg) = weak.upgrade() {
                        reg.purge(seq);
                    }
                });
                match listener {
                    Some(id) => Some((ctx.clone(), id)),
                    None => {
                        log::debug!("{} caller of {} already gone, not queued", self.id, msg);
                        return;
                    }
                }
            } else {
                None
            };
            state.queue.push_back(Pending { seq, msg, cleanup });
            let excess = state.queue.len().saturating_sub(self.max_queue);
            let evicted: Vec<Pending> = state.queue.drain(..excess).collect();
            evicted
        };
        for p in evicted {
            self.dropped.inc();
            p.release();
            log::debug!("{} queue full, dropped {}", self.id, p.msg);
        }
    }

    fn purge(&self, seq: u64) {
        let mut state = self.state.lock();
        if let Some(idx) = state.queue.iter().position(|p| p.seq == seq) {
            state.queue.remove(idx);
        }
    }

    /// Delivers every queued message the router declares ready, oldest first.
    ///
    /// Concurrent callers coalesce: whoever holds the pump drains again on their behalf.
    pub fn pump(&self) {
        self.pump_pending.store(true, Ordering::SeqCst);
        loop {
            {
                let _guard = match self.pump_lock.try_lock() {
                    Some(g) => g,
                    None => return,
                };
                while self.pump_pending.swap(false, Ordering::SeqCst) {
                    self.drain();
                }
            }
            if !self.pump_pending.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    fn drain(&self) {
        let mut cursor = 0;
        loop {
            let (seq, msg) = {
                let state = self.state.lock();
                match state.queue.iter().find(|p| p.seq > cursor) {
                    Some(p) => (p.seq, p.msg.clone()),
                    None => return,
                }
            };
            cursor = seq;

            let decision = self.decide(&self.subscriptions(), &msg);
            if !decision.ready {
                continue;
            }
            let taken = {
                let mut state = self.state.lock();
                let idx = state.queue.iter().position(|p| p.seq == seq);
                idx.and_then(|idx| state.queue.remove(idx))
            };
            if let Some(p) = taken {
                p.release();
                Self::deliver(&decision.subs, p.msg);
            }
        }
    }

    fn deliver(subs: &[Arc<Subscription>], msg: Arc<Message>) {
        for sub in subs {
            sub.forward(msg.clone());
        }
    }

    /// Current subscriptions in attach order.
    pub fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.state.lock().subs.values().map(|a| a.sub.clone()).collect()
    }

    pub fn attach(&self, sub: Arc<Subscription>, listener: ListenerId) {
        self.state.lock().subs.insert(sub.seq(), Attached { sub, listener });
    }

    /// Removes a subscription whose context finalized.
    pub fn detach(&self, seq: u64) -> Option<Arc<Subscription>> {
        self.state.lock().subs.remove(&seq).map(|a| a.sub)
    }

    /// Empties the registration, returning the subscriptions that were attached.
    pub fn close(&self) -> Vec<Arc<Subscription>> {
        let (queue, subs) = {
            let mut state = self.state.lock();
            (std::mem::take(&mut state.queue), std::mem::take(&mut state.subs))
        };
        for p in queue.iter() {
            p.release();
        }
        subs.into_values()
            .map(|a| {
                a.sub.ctx().off_finalize(a.listener);
                a.sub
            })
            .collect()
    }

    pub fn describe(&self) -> serde_json::Value {
        let (size, subs) = {
            let state = self.state.lock();
            (state.queue.len(), state.subs.values().map(|a| a.sub.describe()).collect::<Vec<_>>())
        };
        json!({
            "id": self.id,
            "tag": self.tag,
            "filter": self.filter.source(),
            "router": self.router.source(),
            "size": size,
            "count": self.accepted(),
            "drop": self.dropped(),
            "subs": subs,
        })
    }

    #[cfg(test)]
    fn queued(&self) -> Vec<Arc<Message>> {
        self.state.lock().queue.iter().map(|p| p.msg.clone()).collect()
    }

    #[cfg(test)]
    fn queued_seqs(&self) -> Vec<u64> {
        self.state.lock().queue.iter().map(|p| p.seq).collect()
    }
}
