//! JSON expressions for registration filters, routers and access grants.
//!
//! Predicates:
//!
//! ```text
//! true | false
//! {"all": [p, ..]}      {"any": [p, ..]}      {"not": p}
//! {"eq": [path, v]}     {"ne": [path, v]}     {"in": [path, [v, ..]]}
//! {"has": [path, v]}    {"prefix": [path, "s"]}  {"exists": path}
//! {"gt" | "ge" | "lt" | "le": [path, number]}
//! ```
//!
//! Paths: `type`, `tint`, `subj`, `targ`, `ver`, `body[.k..]`, `meta[.k..]`, `auth[.k..]`,
//! `headers.k`, `cookies.k` and `user`, which is only bound while evaluating grants.
//!
//! Routers: `{"select": "all" | "first" | "last" | "targets" | {"tags": [..]},
//! "ready": "always" | "subscribed" | {"min": n}}`.

use std::borrow::Cow;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::PipeError;
use crate::message::Message;
use crate::registration::{Decision, Filter, Route};
use crate::subscription::Subscription;

#[derive(Debug, Clone, PartialEq)]
pub enum Path {
    Type,
    Tint,
    Subj,
    Targ,
    Ver,
    Body(Vec<String>),
    Meta(Vec<String>),
    Auth(Vec<String>),
    Header(String),
    Cookie(String),
    User,
}

impl Path {
    pub fn parse(text: &str) -> Result<Self, PipeError> {
        let mut parts = text.split('.');
        let root = parts.next().unwrap_or_default();
        let rest = parts.map(String::from).collect::<Vec<_>>();
        let path = match (root, rest.as_slice()) {
            ("type", []) => Path::Type,
            ("tint", []) => Path::Tint,
            ("subj", []) => Path::Subj,
            ("targ", []) => Path::Targ,
            ("ver", []) => Path::Ver,
            ("user", []) => Path::User,
            ("body", keys) => Path::Body(keys.to_vec()),
            ("meta", keys) => Path::Meta(keys.to_vec()),
            ("auth", keys) => Path::Auth(keys.to_vec()),
            ("headers", [k]) if !k.is_empty() => Path::Header(k.clone()),
            ("cookies", [k]) if !k.is_empty() => Path::Cookie(k.clone()),
            _ => return Err(bad_path(text)),
        };
        Ok(path)
    }

    fn resolve<'a>(&self, scope: &Scope<'a>) -> Option<Cow<'a, Value>> {
        let msg = scope.msg;
        match self {
            Path::Type => Some(Cow::Owned(Value::String(msg.typ.as_str().to_owned()))),
            Path::Tint => msg.tint.as_ref().map(|t| Cow::Owned(Value::String(t.clone()))),
            Path::Subj => Some(Cow::Owned(Value::String(msg.subj.clone()))),
            Path::Targ => Some(Cow::Owned(Value::from(msg.targ.clone()))),
            Path::Ver => Some(Cow::Owned(Value::from(msg.ver))),
            Path::Body(keys) => lookup(&msg.body, keys).map(Cow::Borrowed),
            Path::Meta(keys) => lookup(&msg.meta, keys).map(Cow::Borrowed),
            Path::Auth(keys) => lookup(&msg.auth, keys).map(Cow::Borrowed),
            Path::Header(k) => msg.headers.get(k).map(|v| Cow::Owned(Value::String(v.clone()))),
            Path::Cookie(k) => msg.cookies.get(k).map(|v| Cow::Owned(Value::String(v.clone()))),
            Path::User => scope.user.map(|u| Cow::Owned(Value::String(u.to_owned()))),
        }
    }
}

fn lookup<'a>(mut v: &'a Value, keys: &[String]) -> Option<&'a Value> {
    for k in keys {
        v = match v {
            Value::Object(m) => m.get(k)?,
            Value::Array(a) => a.get(k.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(v)
}

#[inline]
fn bad_path(text: &str) -> PipeError {
    PipeError::BadRequest(format!("unknown path: {text}"))
}

#[inline]
fn bad_expr(what: &str, v: &Value) -> PipeError {
    PipeError::BadRequest(format!("bad {what} expression: {v}"))
}

/// What a predicate sees: the message and, for grants, the authenticated user.
#[derive(Clone, Copy)]
pub struct Scope<'a> {
    pub msg: &'a Message,
    pub user: Option<&'a str>,
}

impl<'a> Scope<'a> {
    #[inline]
    pub fn new(msg: &'a Message) -> Self {
        Scope { msg, user: None }
    }

    #[inline]
    pub fn user(mut self, user: Option<&'a str>) -> Self {
        self.user = user;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Const(bool),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
    Eq(Path, Value),
    Ne(Path, Value),
    In(Path, Vec<Value>),
    Has(Path, Value),
    Prefix(Path, String),
    Exists(Path),
    Cmp(Path, CmpOp, f64),
}

impl Predicate {
    pub fn compile(v: &Value) -> Result<Self, PipeError> {
        let obj = match v {
            Value::Bool(b) => return Ok(Predicate::Const(*b)),
            Value::Object(obj) if obj.len() == 1 => obj,
            _ => return Err(bad_expr("predicate", v)),
        };
        let (op, arg) = match obj.iter().next() {
            Some(kv) => kv,
            None => return Err(bad_expr("predicate", v)),
        };
        let pred = match op.as_str() {
            "all" => Predicate::All(Self::compile_list(arg)?),
            "any" => Predicate::Any(Self::compile_list(arg)?),
            "not" => Predicate::Not(Box::new(Self::compile(arg)?)),
            "exists" => Predicate::Exists(Path::parse(arg.as_str().ok_or_else(|| bad_expr(op, arg))?)?),
            "eq" | "ne" | "in" | "has" | "prefix" | "gt" | "ge" | "lt" | "le" => {
                let (path, operand) = match arg.as_array().map(Vec::as_slice) {
                    Some([Value::String(path), operand]) => (Path::parse(path)?, operand),
                    _ => return Err(bad_expr(op, arg)),
                };
                match op.as_str() {
                    "eq" => Predicate::Eq(path, operand.clone()),
                    "ne" => Predicate::Ne(path, operand.clone()),
                    "in" => Predicate::In(path, operand.as_array().ok_or_else(|| bad_expr(op, arg))?.clone()),
                    "has" => Predicate::Has(path, operand.clone()),
                    "prefix" => Predicate::Prefix(path, operand.as_str().ok_or_else(|| bad_expr(op, arg))?.into()),
                    cmp => {
                        let n = operand.as_f64().ok_or_else(|| bad_expr(op, arg))?;
                        let cmp = match cmp {
                            "gt" => CmpOp::Gt,
                            "ge" => CmpOp::Ge,
                            "lt" => CmpOp::Lt,
                            _ => CmpOp::Le,
                        };
                        Predicate::Cmp(path, cmp, n)
                    }
                }
            }
            _ => return Err(PipeError::BadRequest(format!("unknown operator: {op}"))),
        };
        Ok(pred)
    }

    fn compile_list(v: &Value) -> Result<Vec<Self>, PipeError> {
        v.as_array().ok_or_else(|| bad_expr("list", v))?.iter().map(Self::compile).collect()
    }

    /// Errors only when a comparison meets a value that is not a number.
    pub fn eval(&self, scope: &Scope<'_>) -> Result<bool, PipeError> {
        Ok(match self {
            Predicate::Const(b) => *b,
            Predicate::All(ps) => {
                for p in ps {
                    if !p.eval(scope)? {
                        return Ok(false);
                    }
                }
                true
            }
            Predicate::Any(ps) => {
                for p in ps {
                    if p.eval(scope)? {
                        return Ok(true);
                    }
                }
                false
            }
            Predicate::Not(p) => !p.eval(scope)?,
            Predicate::Eq(path, v) => path.resolve(scope).is_some_and(|r| r.as_ref() == v),
            Predicate::Ne(path, v) => !path.resolve(scope).is_some_and(|r| r.as_ref() == v),
            Predicate::In(path, vs) => path.resolve(scope).is_some_and(|r| vs.contains(r.as_ref())),
            Predicate::Has(path, v) => match path.resolve(scope).as_deref() {
                Some(Value::Array(a)) => a.contains(v),
                Some(Value::Object(m)) => v.as_str().is_some_and(|k| m.contains_key(k)),
                _ => false,
            },
            Predicate::Prefix(path, s) => match path.resolve(scope).as_deref() {
                Some(Value::String(r)) => r.starts_with(s.as_str()),
                _ => false,
            },
            Predicate::Exists(path) => path.resolve(scope).is_some_and(|r| !r.is_null()),
            Predicate::Cmp(path, op, n) => match path.resolve(scope) {
                None => false,
                Some(r) => {
                    let r = r.as_f64().ok_or_else(|| {
                        PipeError::FilterOrRouter(format!("{path:?} is not a number, {}", r.as_ref()))
                    })?;
                    match op {
                        CmpOp::Gt => r > *n,
                        CmpOp::Ge => r >= *n,
                        CmpOp::Lt => r < *n,
                        CmpOp::Le => r <= *n,
                    }
                }
            },
        })
    }
}

/// A compiled predicate together with the text it was compiled from.
#[derive(Debug, Clone)]
pub struct Expr {
    source: String,
    pred: Predicate,
}

impl Expr {
    pub fn parse(source: &str) -> Result<Self, PipeError> {
        let v: Value = serde_json::from_str(source)?;
        Ok(Expr { source: source.trim().to_owned(), pred: Predicate::compile(&v)? })
    }

    /// Matches every message.
    pub fn always() -> Self {
        Expr { source: "true".into(), pred: Predicate::Const(true) }
    }

    /// Matches `config-oneway` and `config-twoway` messages.
    pub fn config() -> Self {
        let types = vec![Value::from("config-oneway"), Value::from("config-twoway")];
        Expr {
            source: r#"{"in":["type",["config-oneway","config-twoway"]]}"#.into(),
            pred: Predicate::In(Path::Type, types),
        }
    }

    #[inline]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[inline]
    pub fn eval(&self, scope: &Scope<'_>) -> Result<bool, PipeError> {
        self.pred.eval(scope)
    }
}

impl Filter for Expr {
    fn filter(&self, msg: &Message) -> Result<bool, PipeError> {
        self.eval(&Scope::new(msg))
    }

    fn source(&self) -> &str {
        &self.source
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Select {
    All,
    First,
    Last,
    Targets,
    Tags(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ready {
    Always,
    Subscribed,
    Min(usize),
}

/// A compiled router: which subscriptions get a message and whether it may go now.
#[derive(Debug, Clone)]
pub struct RouterExpr {
    source: String,
    select: Select,
    ready: Ready,
}

impl RouterExpr {
    pub fn parse(source: &str) -> Result<Self, PipeError> {
        let v: Value = serde_json::from_str(source)?;
        let obj = v.as_object().ok_or_else(|| bad_expr("router", &v))?;
        if let Some(k) = obj.keys().find(|k| !matches!(k.as_str(), "select" | "ready")) {
            return Err(PipeError::BadRequest(format!("unknown router key: {k}")));
        }
        Ok(RouterExpr {
            source: source.trim().to_owned(),
            select: Self::select(obj)?,
            ready: Self::ready(obj)?,
        })
    }

    fn select(obj: &Map<String, Value>) -> Result<Select, PipeError> {
        let v = match obj.get("select") {
            None => return Ok(Select::All),
            Some(v) => v,
        };
        match v {
            Value::String(s) => match s.as_str() {
                "all" => Ok(Select::All),
                "first" => Ok(Select::First),
                "last" => Ok(Select::Last),
                "targets" => Ok(Select::Targets),
                _ => Err(bad_expr("select", v)),
            },
            Value::Object(m) => match m.get("tags").and_then(Value::as_array) {
                Some(tags) if m.len() == 1 => tags
                    .iter()
                    .map(|t| t.as_str().map(String::from).ok_or_else(|| bad_expr("select", v)))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Select::Tags),
                _ => Err(bad_expr("select", v)),
            },
            _ => Err(bad_expr("select", v)),
        }
    }

    fn ready(obj: &Map<String, Value>) -> Result<Ready, PipeError> {
        let v = match obj.get("ready") {
            None => return Ok(Ready::Subscribed),
            Some(v) => v,
        };
        match v {
            Value::String(s) if s == "always" => Ok(Ready::Always),
            Value::String(s) if s == "subscribed" => Ok(Ready::Subscribed),
            Value::Object(m) if m.len() == 1 => {
                m.get("min").and_then(Value::as_u64).map(|n| Ready::Min(n as usize)).ok_or_else(|| bad_expr("ready", v))
            }
            _ => Err(bad_expr("ready", v)),
        }
    }

    /// Broadcast to whoever is attached, never queue.
    pub fn broadcast() -> Self {
        RouterExpr { source: r#"{"select":"all","ready":"always"}"#.into(), select: Select::All, ready: Ready::Always }
    }

    /// Deliver to subscriptions whose tag is one of the message targets, never queue.
    pub fn targets() -> Self {
        RouterExpr {
            source: r#"{"select":"targets","ready":"always"}"#.into(),
            select: Select::Targets,
            ready: Ready::Always,
        }
    }
}

impl Route for RouterExpr {
    fn route(&self, subs: &[Arc<Subscription>], msg: &Message) -> Result<Decision, PipeError> {
        let selected: Vec<Arc<Subscription>> = match &self.select {
            Select::All => subs.to_vec(),
            Select::First => subs.first().cloned().into_iter().collect(),
            Select::Last => subs.last().cloned().into_iter().collect(),
            Select::Targets => subs.iter().filter(|s| msg.targ.iter().any(|t| t == s.tag())).cloned().collect(),
            Select::Tags(tags) => subs.iter().filter(|s| tags.iter().any(|t| t == s.tag())).cloned().collect(),
        };
        let ready = match self.ready {
            Ready::Always => true,
            Ready::Subscribed => !selected.is_empty(),
            Ready::Min(n) => selected.len() >= n,
        };
        Ok(Decision { subs: selected, ready })
    }

    fn source(&self) -> &str {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use serde_json::json;

    fn eval(src: &str, msg: &Message) -> bool {
        Expr::parse(src).unwrap().filter(msg).unwrap()
    }

    fn sub(tag: &str) -> Arc<Subscription> {
        Arc::new(Subscription::new(0, "reg", tag, Context::new("t-1:1"), Box::new(|_| Ok(()))))
    }

    #[test]
    fn test_predicates() {
        let msg = Message::oneway()
            .subject("ORDER")
            .targets(["billing", "audit"])
            .body(json!({"amount": 12, "items": ["a", "b"], "ship": {"to": "fr"}}))
            .header("x-src", "web");

        assert!(eval("true", &msg));
        assert!(!eval("false", &msg));
        assert!(eval(r#"{"eq":["subj","ORDER"]}"#, &msg));
        assert!(eval(r#"{"eq":["type","oneway"]}"#, &msg));
        assert!(eval(r#"{"eq":["body.ship.to","fr"]}"#, &msg));
        assert!(eval(r#"{"eq":["body.items.1","b"]}"#, &msg));
        assert!(eval(r#"{"ne":["body.missing",1]}"#, &msg));
        assert!(eval(r#"{"has":["targ","audit"]}"#, &msg));
        assert!(eval(r#"{"in":["headers.x-src",["web","cli"]]}"#, &msg));
        assert!(eval(r#"{"prefix":["subj","ORD"]}"#, &msg));
        assert!(eval(r#"{"exists":"body.amount"}"#, &msg));
        assert!(!eval(r#"{"exists":"meta"}"#, &msg));
        assert!(eval(r#"{"all":[{"gt":["body.amount",10]},{"le":["body.amount",12]}]}"#, &msg));
        assert!(eval(r#"{"any":[false,{"not":{"lt":["body.amount",5]}}]}"#, &msg));
    }

    #[test]
    fn test_compile_errors() {
        assert!(Expr::parse(r#"{"xor":[true,false]}"#).is_err());
        assert!(Expr::parse(r#"{"eq":["secret.k",1]}"#).is_err());
        assert!(Expr::parse(r#"{"eq":["subj"]}"#).is_err());
        assert!(Expr::parse(r#"{"gt":["body.n","x"]}"#).is_err());
        assert!(Expr::parse(r#"{"eq":["headers",1]}"#).is_err());
        assert!(Expr::parse("function(m) { return true; }").is_err());
        assert!(RouterExpr::parse(r#"{"select":"random"}"#).is_err());
        assert!(RouterExpr::parse(r#"{"select":"all","later":true}"#).is_err());
    }

    #[test]
    fn test_eval_error() {
        let msg = Message::oneway().body(json!({"n": "seven"}));
        let e = Expr::parse(r#"{"gt":["body.n",1]}"#).unwrap();
        assert!(matches!(e.filter(&msg), Err(PipeError::FilterOrRouter(_))));
        assert!(!e.filter(&Message::oneway()).unwrap());
    }

    #[test]
    fn test_user_scope() {
        let e = Expr::parse(r#"{"eq":["user","alice"]}"#).unwrap();
        let msg = Message::oneway();
        assert!(e.eval(&Scope::new(&msg).user(Some("alice"))).unwrap());
        assert!(!e.eval(&Scope::new(&msg)).unwrap());
    }

    #[test]
    fn test_router() {
        let subs = vec![sub("a"), sub("b"), sub("c")];
        let msg = Message::oneway().targets(["c", "a"]);

        let r = RouterExpr::parse(r#"{"select":"targets"}"#).unwrap();
        let d = r.route(&subs, &msg).unwrap();
        assert_eq!(d.subs.iter().map(|s| s.tag()).collect::<Vec<_>>(), vec!["a", "c"]);
        assert!(d.ready);

        let d = RouterExpr::parse(r#"{"select":"last"}"#).unwrap().route(&subs, &msg).unwrap();
        assert_eq!(d.subs[0].tag(), "c");

        let d = RouterExpr::parse(r#"{"select":{"tags":["z"]}}"#).unwrap().route(&subs, &msg).unwrap();
        assert!(d.subs.is_empty());
        assert!(!d.ready);

        let d = RouterExpr::parse(r#"{"ready":{"min":4}}"#).unwrap().route(&subs, &msg).unwrap();
        assert_eq!(d.subs.len(), 3);
        assert!(!d.ready);

        let d = RouterExpr::broadcast().route(&[], &msg).unwrap();
        assert!(d.ready);
    }
}
