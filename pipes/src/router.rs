use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::context::{Context, ListenerId};
use crate::error::PipeError;
use crate::expr::{Expr, RouterExpr};
use crate::message::{Message, MessageType};
use crate::registration::{Filter, Registration, Route};
use crate::subscription::{ForwardFn, Subscription};

type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;

/// Receives the answer of a routed message: an ack, or the reply of a two-way call.
pub type ReplyFn = Box<dyn FnOnce(Arc<Message>) -> Result<(), PipeError> + Send + Sync>;

pub const ALL: &str = "all";
pub const CONFIG: &str = "config";

struct TwoWay {
    ctx: Context,
    reply: ReplyFn,
    listener: Option<ListenerId>,
}

impl TwoWay {
    #[inline]
    fn release(&self) {
        if let Some(id) = self.listener {
            self.ctx.off_finalize(id);
        }
    }
}

/// Holds every registration and the in-flight two-way calls.
pub struct Router {
    regs: RwLock<HashMap<String, Arc<Registration>>>,
    twoways: Arc<DashMap<String, TwoWay>>,
    max_queue: usize,
    sub_seq: AtomicU64,
}

impl Router {
    pub fn new(max_queue: usize) -> Self {
        let router = Router {
            regs: RwLock::new(HashMap::default()),
            twoways: Arc::new(DashMap::default()),
            max_queue,
            sub_seq: AtomicU64::new(0),
        };
        router.install_builtins();
        router
    }

    fn install_builtins(&self) {
        let builtins = [
            (ALL, Expr::always(), RouterExpr::broadcast()),
            (CONFIG, Expr::config(), RouterExpr::targets()),
        ];
        let mut regs = self.regs.write();
        for (id, filter, router) in builtins {
            let reg = Registration::new(id, id, Box::new(filter), Box::new(router), self.max_queue).builtin();
            regs.insert(id.to_owned(), Arc::new(reg));
        }
    }

    /// Dispatches `msg` by type. Failures are reported on `ctx`, answers go to `reply`.
    pub fn route(&self, ctx: &Context, mut msg: Message, reply: ReplyFn) {
        if msg.tint.is_none() {
            msg.set_tint(&ctx.tint());
        }
        let msg = Arc::new(msg);
        ctx.log_debug(&format!("route {msg}"));

        match msg.typ {
            MessageType::OneWay | MessageType::ConfigOneWay => {
                if self.forward(ctx, &msg) == 0 {
                    ctx.error(PipeError::NoMatchingRegistration(msg.typ.clone()));
                    return;
                }
                if let Err(e) = reply(Arc::new(Message::ack(&msg))) {
                    ctx.error(e);
                }
            }
            MessageType::TwoWay | MessageType::ConfigTwoWay => self.route_twoway(ctx, msg, reply),
            MessageType::Reply => self.route_reply(ctx, msg, reply),
            MessageType::Ack | MessageType::Other(_) => {
                ctx.error(PipeError::UnknownMessageType(msg.typ.to_string()));
            }
        }
    }

    fn route_twoway(&self, ctx: &Context, msg: Arc<Message>, reply: ReplyFn) {
        let tint = msg.tint_str().to_owned();

        let twoways = Arc::downgrade(&self.twoways);
        let key = tint.clone();
        let listener = ctx.on_finalize(move |ctx| {
            if let Some(twoways) = twoways.upgrade() {
                twoways.remove_if(&key, |_, tw| tw.ctx.ptr_eq(ctx));
            }
        });
        if listener.is_none() {
            ctx.log_debug("caller finalized before routing");
            return;
        }

        //The entry goes in before forwarding so that a fast reply always finds it.
        if let Some(old) = self.twoways.insert(tint.clone(), TwoWay { ctx: ctx.clone(), reply, listener }) {
            old.release();
            old.ctx.log_err(&format!("two-way call {tint} superseded"));
        }
        if ctx.is_finalized() {
            self.twoways.remove_if(&tint, |_, tw| tw.ctx.ptr_eq(ctx));
            return;
        }

        if self.forward(ctx, &msg) == 0 {
            if let Some((_, tw)) = self.twoways.remove_if(&tint, |_, tw| tw.ctx.ptr_eq(ctx)) {
                tw.release();
            }
            ctx.error(PipeError::NoMatchingRegistration(msg.typ.clone()));
        }
    }

    fn route_reply(&self, ctx: &Context, msg: Arc<Message>, reply: ReplyFn) {
        let tw = match self.twoways.remove(msg.tint_str()) {
            Some((_, tw)) => tw,
            None => {
                ctx.error(PipeError::AlreadyRepliedOrTimedOut);
                return;
            }
        };
        tw.release();
        let TwoWay { ctx: caller, reply: answer, .. } = tw;
        if let Err(e) = answer(msg.clone()) {
            caller.error(e);
        }
        if let Err(e) = reply(Arc::new(Message::ack(&msg))) {
            ctx.error(e);
        }
    }

    /// Offers `msg` to every registration and returns how many took it.
    fn forward(&self, ctx: &Context, msg: &Arc<Message>) -> usize {
        let regs = self.regs.read().values().cloned().collect::<Vec<_>>();
        regs.iter().map(|reg| reg.forward(ctx, msg.clone())).filter(|taken| *taken).count()
    }

    /// Installs a registration under the caller's tint, replacing any previous one.
    pub fn register(
        &self,
        ctx: &Context,
        tag: &str,
        filter: Box<dyn Filter>,
        router: Box<dyn Route>,
    ) -> Result<String, PipeError> {
        let id = ctx.tint();
        if id == ALL || id == CONFIG {
            return Err(PipeError::BadRequest(format!("reserved registration id: {id}")));
        }
        let reg = Arc::new(Registration::new(id.clone(), tag, filter, router, self.max_queue));
        let old = self.regs.write().insert(id.clone(), reg);
        if let Some(old) = old {
            ctx.log_out(&format!("re-register {id}"));
            Self::revoke(&old);
        }
        ctx.log_out(&format!("register {id} tag: {tag}"));
        Ok(id)
    }

    /// Removes a registration. Built-ins are only removed by [`Router::shutdown`].
    pub fn unregister(&self, ctx: &Context, id: &str) -> bool {
        let reg = {
            let mut regs = self.regs.write();
            match regs.get(id) {
                Some(reg) if !reg.is_builtin() => regs.remove(id),
                _ => None,
            }
        };
        match reg {
            Some(reg) => {
                ctx.log_out(&format!("unregister {id}"));
                Self::revoke(&reg);
                true
            }
            None => false,
        }
    }

    fn revoke(reg: &Registration) {
        for sub in reg.close() {
            sub.ctx().error(PipeError::Unregistered(reg.id().to_owned()));
        }
    }

    /// Attaches a consumer to the registration with id `id_or_tag`, or else the first one
    /// tagged `id_or_tag`. The subscription lives until `ctx` finalizes.
    pub fn subscribe(&self, ctx: &Context, id_or_tag: &str, tag: &str, forward: ForwardFn) -> bool {
        let reg = {
            let regs = self.regs.read();
            regs.get(id_or_tag).or_else(|| regs.values().find(|r| r.tag() == id_or_tag)).cloned()
        };
        let reg = match reg {
            Some(reg) => reg,
            None => {
                ctx.error(PipeError::UnknownRegistration(id_or_tag.to_owned()));
                return false;
            }
        };

        let seq = self.sub_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(&reg);
        let listener = ctx.on_finalize(move |ctx| {
            if let Some(reg) = weak.upgrade() {
                if reg.detach(seq).is_some() {
                    ctx.log_debug(&format!("unsubscribe {}", reg.id()));
                }
            }
        });
        let listener = match listener {
            Some(l) => l,
            None => return false,
        };
        reg.attach(Arc::new(Subscription::new(seq, reg.id(), tag, ctx.clone(), forward)), listener);

        if ctx.is_finalized() {
            reg.detach(seq);
            return false;
        }
        let current = self.regs.read().get(reg.id()).map(|r| Arc::ptr_eq(r, &reg)).unwrap_or(false);
        if !current {
            if reg.detach(seq).is_some() {
                ctx.off_finalize(listener);
            }
            ctx.error(PipeError::Unregistered(reg.id().to_owned()));
            return false;
        }

        ctx.log_out(&format!("subscribe {} tag: {}", reg.id(), tag));
        reg.pump();
        true
    }

    /// `{id: describe}` for one registration or all of them.
    pub fn list(&self, id: Option<&str>) -> Value {
        let regs = self.regs.read();
        let descs: Map<String, Value> = match id {
            Some(id) => regs.get(id).map(|r| (id.to_owned(), r.describe())).into_iter().collect(),
            None => regs.iter().map(|(id, r)| (id.clone(), r.describe())).collect(),
        };
        Value::Object(descs)
    }

    /// Drops every registration and fails every pending two-way call.
    pub fn shutdown(&self, ctx: &Context) {
        ctx.log_out("router shutdown");
        let regs = self.regs.write().drain().map(|(_, r)| r).collect::<Vec<_>>();
        for reg in regs.iter() {
            Self::revoke(reg);
        }
        let tints = self.twoways.iter().map(|e| e.key().clone()).collect::<Vec<_>>();
        for tint in tints {
            if let Some((_, tw)) = self.twoways.remove(&tint) {
                tw.release();
                tw.ctx.error(PipeError::Shutdown);
            }
        }
    }

    #[inline]
    pub fn twoway_count(&self) -> usize {
        self.twoways.len()
    }

    #[inline]
    pub fn registration(&self, id: &str) -> Option<Arc<Registration>> {
        self.regs.read().get(id).cloned()
    }
}
