//! Model-driven access-control engine.
//!
//! A declarative model names a request shape, rule families, matcher
//! expressions and a combining effect; the engine decides allow/deny per
//! request by scanning the rule set through a per-matcher index, mapping
//! matches to effects and combining them. Rule changes mirror into a storage
//! adapter through the storage controller.

pub mod cache;
pub mod config;
pub mod defs;
pub mod effector;
pub mod enforcer;
pub mod error;
pub mod fm;
pub mod functions;
pub mod matcher;
pub mod model;
pub mod policy;
pub mod rbac;
pub mod storage;
pub mod types;

pub use types::{rule, rule_hash, Effect, Rule, DEFAULT_SEP};

pub use error::{Error, Result};

pub use defs::{EffectDef, MatcherDef, MatcherStage, PolicyDef, RequestDef, RoleDef};

pub use functions::{NameMatcher, PrefixMatcher};

pub use fm::{set_function, FunctionMap};

pub use policy::{Emitter, ListenerId, Policy, RuleStore, StoreEvent};

pub use rbac::{
    generate_g_function, DefaultRoleManager, DomainManager, RoleManager, RolePolicy,
};

pub use matcher::Matcher;

pub use effector::{DefaultEffector, Effector};

pub use model::Model;

pub use storage::{
    Adapter, BatchAdapter, FileAdapter, NoopAdapter, RuleSink, RuleSource, SimpleAdapter,
    StorageController,
};

pub use enforcer::{
    AdapterInit, ContextOption, EnforceArg, Enforcer, EnforcerOption, ModelInit,
};

pub use matchexpr::Value;
