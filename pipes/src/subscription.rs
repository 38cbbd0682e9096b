use std::sync::Arc;

use serde_json::json;

use pipes_utils::Counter;

use crate::context::Context;
use crate::error::PipeError;
use crate::message::Message;

pub type ForwardFn = Box<dyn Fn(Arc<Message>) -> Result<(), PipeError> + Send + Sync>;

/// One live consumer attached to a registration.
pub struct Subscription {
    seq: u64,
    reg_id: String,
    tag: String,
    ctx: Context,
    forward: ForwardFn,
    count: Counter,
}

impl Subscription {
    pub fn new<R, T>(seq: u64, reg_id: R, tag: T, ctx: Context, forward: ForwardFn) -> Self
    where
        R: Into<String>,
        T: Into<String>,
    {
        Subscription { seq, reg_id: reg_id.into(), tag: tag.into(), ctx, forward, count: Counter::new() }
    }

    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[inline]
    pub fn reg_id(&self) -> &str {
        &self.reg_id
    }

    #[inline]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    #[inline]
    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count.count()
    }

    /// Hands `msg` to the consumer. A failing callback is reported on the subscriber's
    /// context and never reaches the caller.
    pub fn forward(&self, msg: Arc<Message>) -> bool {
        self.count.inc();
        match (self.forward)(msg) {
            Ok(()) => true,
            Err(e) => {
                self.ctx.error(e);
                false
            }
        }
    }

    pub fn describe(&self) -> serde_json::Value {
        json!({
            "id": self.ctx.tint(),
            "reg": self.reg_id,
            "tag": self.tag,
            "count": self.count(),
        })
    }
}
