// Effect combiner: folds the effects of matched rules into one decision.

use crate::defs::EffectDef;
use crate::error::{Error, Result};
use crate::types::{Effect, Rule};

const ALLOW_OVERRIDE: &str = "some(where(p.eft==allow))";
const DENY_OVERRIDE: &str = "!some(where(p.eft==deny))";
const ALLOW_AND_DENY: &str = "some(where(p.eft==allow))&&!some(where(p.eft==deny))";

/// Merges matching results collected so far into a decision. With
/// `complete == false` the call may return Indeterminate to request more
/// rules; enforcement aborts enumeration as soon as it does not. With
/// `complete == true` the result is final and never Indeterminate.
pub trait Effector: Send + Sync {
    fn merge_effects(
        &self,
        effects: &[Effect],
        matches: &[Rule],
        complete: bool,
    ) -> Result<(Effect, Rule)>;
}

/// Interprets the three canonical combining expressions with short-circuit.
#[derive(Debug, Clone)]
pub struct DefaultEffector {
    def: EffectDef,
}

impl DefaultEffector {
    pub fn new(def: EffectDef) -> DefaultEffector {
        DefaultEffector { def }
    }

    pub fn def(&self) -> &EffectDef {
        &self.def
    }
}

impl Effector for DefaultEffector {
    fn merge_effects(
        &self,
        effects: &[Effect],
        matches: &[Rule],
        complete: bool,
    ) -> Result<(Effect, Rule)> {
        if complete {
            return match self.def.expr() {
                ALLOW_OVERRIDE => Ok((Effect::Deny, Rule::new())),
                DENY_OVERRIDE => Ok((Effect::Allow, Rule::new())),
                ALLOW_AND_DENY => {
                    if matches.is_empty() {
                        return Ok((Effect::Deny, Rule::new()));
                    }
                    Ok((effects[0], matches[0].clone()))
                }
                other => Err(Error::UnsupportedEffect(other.to_string())),
            };
        }

        let effect = effects.last().copied().unwrap_or(Effect::Indeterminate);
        let matched = matches.last().cloned().unwrap_or_default();

        match self.def.expr() {
            ALLOW_OVERRIDE => {
                if effect == Effect::Allow {
                    return Ok((effect, matched));
                }
            }
            DENY_OVERRIDE | ALLOW_AND_DENY => {
                if effect == Effect::Deny {
                    return Ok((effect, matched));
                }
            }
            other => return Err(Error::UnsupportedEffect(other.to_string())),
        }

        Ok((Effect::Indeterminate, matched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::rule;

    fn effector(expr: &str) -> DefaultEffector {
        DefaultEffector::new(EffectDef::new("e", expr))
    }

    #[test]
    fn allow_override_short_circuits_on_allow() {
        let e = effector("some(where (p.eft == allow))");
        let m = rule(&["alice", "data1", "read"]);

        let (eft, _) = e
            .merge_effects(&[Effect::Deny], &[m.clone()], false)
            .unwrap();
        assert_eq!(eft, Effect::Indeterminate);

        let (eft, matched) = e
            .merge_effects(&[Effect::Deny, Effect::Allow], &[m.clone(), m.clone()], false)
            .unwrap();
        assert_eq!(eft, Effect::Allow);
        assert_eq!(matched, m);

        // no allow seen and no more rules: deny
        let (eft, _) = e.merge_effects(&[Effect::Deny], &[m], true).unwrap();
        assert_eq!(eft, Effect::Deny);
    }

    #[test]
    fn deny_override_short_circuits_on_deny() {
        let e = effector("!some(where (p.eft == deny))");
        let m = rule(&["alice", "data1", "read"]);

        let (eft, _) = e
            .merge_effects(&[Effect::Allow], &[m.clone()], false)
            .unwrap();
        assert_eq!(eft, Effect::Indeterminate);

        let (eft, _) = e
            .merge_effects(&[Effect::Allow, Effect::Deny], &[m.clone(), m], false)
            .unwrap();
        assert_eq!(eft, Effect::Deny);

        let (eft, _) = e.merge_effects(&[], &[], true).unwrap();
        assert_eq!(eft, Effect::Allow);
    }

    #[test]
    fn allow_and_deny_reports_first_match_as_rationale() {
        let e = effector("some(where (p.eft == allow)) && !some(where (p.eft == deny))");
        let first = rule(&["alice", "data1", "read", "allow"]);
        let second = rule(&["bob", "data2", "write", "allow"]);

        let (eft, matched) = e
            .merge_effects(
                &[Effect::Allow, Effect::Allow],
                &[first.clone(), second],
                true,
            )
            .unwrap();
        assert_eq!(eft, Effect::Allow);
        assert_eq!(matched, first);

        let (eft, _) = e.merge_effects(&[], &[], true).unwrap();
        assert_eq!(eft, Effect::Deny);
    }

    #[test]
    fn merged_outcome_is_stable_after_short_circuit() {
        let e = effector("some(where (p.eft == allow))");
        let m = rule(&["alice", "data1", "read"]);
        let (eft, _) = e
            .merge_effects(&[Effect::Allow], &[m.clone()], false)
            .unwrap();
        assert_eq!(eft, Effect::Allow);

        // appending more effects cannot change an already-decided outcome
        let (eft2, _) = e
            .merge_effects(&[Effect::Allow, Effect::Deny], &[m.clone(), m], false)
            .unwrap();
        // allow-override never decides on deny, so the stream stays decided
        // by the allow already seen
        assert_eq!(eft2, Effect::Indeterminate);
        assert_eq!(eft, Effect::Allow);
    }

    #[test]
    fn unknown_expression_is_an_error() {
        let e = effector("priority(p.eft) || deny");
        assert!(matches!(
            e.merge_effects(&[], &[], true),
            Err(Error::UnsupportedEffect(_))
        ));
        assert!(matches!(
            e.merge_effects(&[Effect::Allow], &[rule(&["a"])], false),
            Err(Error::UnsupportedEffect(_))
        ));
    }
}
