use serde_json::{json, Map, Value};

use crate::auth::AuthResult;
use crate::context::Context;
use crate::expr::{Expr, Scope};
use crate::message::Message;

type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;

struct Grant {
    tag: String,
    filter: Expr,
}

/// Decides whether a submitted message may be routed.
///
/// Access is the OR of all installed grants and is denied when there are none.
#[derive(Default)]
pub struct Access {
    grants: DashMap<String, Grant>,
}

impl Access {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `filter` under the caller's tint, replacing a previous grant with that id.
    pub fn grant(&self, ctx: &Context, tag: &str, filter: Expr) -> String {
        let id = ctx.tint();
        ctx.log_out(&format!("grant {id} tag: {tag}, {}", filter.source()));
        self.grants.insert(id.clone(), Grant { tag: tag.to_owned(), filter });
        id
    }

    pub fn revoke(&self, ctx: &Context, id: &str) -> bool {
        let revoked = self.grants.remove(id).is_some();
        if revoked {
            ctx.log_out(&format!("revoke {id}"));
        }
        revoked
    }

    pub fn is_granted(&self, auth: &AuthResult, msg: &Message) -> bool {
        let scope = Scope::new(msg).user(auth.user());
        self.grants.iter().any(|g| match g.filter.eval(&scope) {
            Ok(granted) => granted,
            Err(e) => {
                log::warn!("grant {} failed on {}, {}", g.key(), msg, e);
                false
            }
        })
    }

    pub fn list(&self, id: Option<&str>) -> Value {
        let describe = |id: &str, g: &Grant| json!({"id": id, "tag": g.tag, "filter": g.filter.source()});
        let grants: Map<String, Value> = match id {
            Some(id) => self.grants.get(id).map(|g| (id.to_owned(), describe(id, &g))).into_iter().collect(),
            None => self.grants.iter().map(|g| (g.key().clone(), describe(g.key(), g.value()))).collect(),
        };
        Value::Object(grants)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.grants.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipes_conf::HmacAlgo;

    fn authed(user: &str) -> AuthResult {
        let cookie = crate::auth::generate_auth_cookie(HmacAlgo::Sha512, "k", user, 0, "auth");
        let value = cookie.split_once('=').map(|(_, v)| v).unwrap();
        crate::auth::authenticate_cookie(HmacAlgo::Sha512, "k", value)
    }

    #[test]
    fn test_fail_closed() {
        let access = Access::new();
        for msg in [Message::oneway(), Message::twoway().subject("x"), Message::reply(&Message::oneway())] {
            assert!(!access.is_granted(&authed("admin"), &msg));
            assert!(!access.is_granted(&AuthResult::default(), &msg));
        }
    }

    #[test]
    fn test_grants_or() {
        let access = Access::new();
        access.grant(&Context::new("g-1:1"), "admins", Expr::parse(r#"{"eq":["user","admin"]}"#).unwrap());
        access.grant(&Context::new("g-1:2"), "pings", Expr::parse(r#"{"eq":["subj","PING"]}"#).unwrap());
        access.grant(&Context::new("g-1:3"), "broken", Expr::parse(r#"{"gt":["body",0]}"#).unwrap());

        let msg = Message::oneway().body("text");
        assert!(access.is_granted(&authed("admin"), &msg));
        assert!(!access.is_granted(&authed("bob"), &msg));
        assert!(!access.is_granted(&AuthResult::default(), &msg));
        assert!(access.is_granted(&AuthResult::default(), &Message::oneway().subject("PING")));
        assert!(access.is_granted(&authed("bob"), &Message::oneway().body(5)));
    }

    #[test]
    fn test_grant_replace_revoke_list() {
        let access = Access::new();
        let ctx = Context::new("g-1:4");
        let id = access.grant(&ctx, "first", Expr::always());
        assert_eq!(access.grant(&ctx, "second", Expr::parse("false").unwrap()), id);
        assert_eq!(access.len(), 1);
        assert_eq!(access.list(Some(&id))[&id]["tag"], "second");
        assert!(!access.is_granted(&AuthResult::default(), &Message::oneway()));

        assert!(access.revoke(&ctx, &id));
        assert!(!access.revoke(&ctx, &id));
        assert_eq!(access.list(None), json!({}));
    }
}
