// End-to-end enforcement scenarios.

use access_engine::{
    functions, rule, ContextOption, EnforceArg, Enforcer, Model, Rule, Value,
};

const BASIC_MODEL: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = r.sub == p.sub && r.obj == p.obj && r.act == p.act
"#;

const RBAC_MODEL: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act

[role_definition]
g = _, _

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = g(r.sub, p.sub) && r.obj == p.obj && r.act == p.act
"#;

const DENY_MODEL: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act, eft

[policy_effect]
e = !some(where (p.eft == deny))

[matchers]
m = r.sub == p.sub && r.obj == p.obj && r.act == p.act
"#;

const DOMAIN_MODEL: &str = r#"
[request_definition]
r = sub, dom, obj, act

[policy_definition]
p = sub, dom, obj, act

[role_definition]
g = _, _, _

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = g(r.sub, p.sub, r.dom) && r.dom == p.dom && r.obj == p.obj && r.act == p.act
"#;

const PATH_MODEL: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = r.sub == p.sub && pathMatch(r.obj, p.obj) && r.act == p.act
"#;

const ABAC_MODEL: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = r.sub.Age > 18 && r.obj == p.obj && r.act == p.act
"#;

fn enforcer(model: &str, rules: &[&[&str]]) -> Enforcer {
    let e = Enforcer::new(Model::from_text(model).unwrap(), ()).unwrap();
    for fields in rules {
        e.add_rule(&rule(fields)).unwrap();
    }
    e
}

fn assert_requests(e: &Enforcer, cases: &[(&[&str], bool)]) {
    for (request, expected) in cases {
        let got = e.enforce_request(request.iter().copied()).unwrap();
        assert_eq!(got, *expected, "request {:?}", request);
    }
}

#[test]
fn basic_allow() {
    let e = enforcer(
        BASIC_MODEL,
        &[
            &["p", "alice", "data1", "read"],
            &["p", "bob", "data2", "write"],
        ],
    );
    assert_requests(
        &e,
        &[
            (&["alice", "data1", "read"], true),
            (&["bob", "data1", "read"], false),
            (&["alice", "data2", "write"], false),
        ],
    );
}

#[test]
fn rbac_inheritance() {
    let e = enforcer(
        RBAC_MODEL,
        &[
            &["p", "alice", "data1", "read"],
            &["p", "bob", "data2", "write"],
            &["p", "data2_admin", "data2", "read"],
            &["p", "data2_admin", "data2", "write"],
            &["g", "alice", "data2_admin"],
        ],
    );
    assert_requests(
        &e,
        &[
            (&["alice", "data2", "read"], true),
            (&["alice", "data2", "write"], true),
            (&["bob", "data2", "read"], false),
            (&["bob", "data2", "write"], true),
        ],
    );
}

#[test]
fn deny_override() {
    let e = enforcer(
        DENY_MODEL,
        &[
            &["p", "alice", "data1", "read", "allow"],
            &["p", "alice", "data1", "read", "deny"],
        ],
    );
    assert_requests(&e, &[(&["alice", "data1", "read"], false)]);
}

#[test]
fn domain_rbac() {
    let e = enforcer(
        DOMAIN_MODEL,
        &[
            &["p", "admin", "domain1", "data1", "read"],
            &["g", "alice", "admin", "domain1"],
        ],
    );
    assert_requests(
        &e,
        &[
            (&["alice", "domain1", "data1", "read"], true),
            (&["alice", "domain2", "data1", "read"], false),
        ],
    );
}

#[test]
fn domain_rbac_with_pattern_domains() {
    let e = enforcer(DOMAIN_MODEL, &[]);
    let rm = e.get_model().get_role_manager("g").unwrap();
    rm.set_domain_matcher(functions::path_name_matcher());

    e.add_rule(&rule(&["p", "admin", "domain1", "data1", "read"]))
        .unwrap();
    e.add_rule(&rule(&["p", "admin", "domain2", "data2", "read"]))
        .unwrap();
    e.add_rule(&rule(&["g", "alice", "admin", "*"])).unwrap();

    assert_requests(
        &e,
        &[
            (&["alice", "domain1", "data1", "read"], true),
            (&["alice", "domain2", "data2", "read"], true),
            (&["alice", "domain1", "data2", "read"], false),
        ],
    );
}

#[test]
fn pattern_path_match() {
    let e = enforcer(PATH_MODEL, &[&["p", "alice", "/alice/*", "GET"]]);
    assert_requests(
        &e,
        &[
            (&["alice", "/alice/1", "GET"], true),
            (&["alice", "/bob/1", "GET"], false),
            (&["bob", "/alice/1", "GET"], false),
        ],
    );
}

#[test]
fn abac_attributes() {
    let e = enforcer(ABAC_MODEL, &[&["p", "_", "/data", "read"]]);

    let adult = e
        .enforce([
            EnforceArg::from(serde_json::json!({"Age": 20})),
            EnforceArg::from("/data"),
            EnforceArg::from("read"),
        ])
        .unwrap();
    assert!(adult);

    let minor = e
        .enforce([
            EnforceArg::from(serde_json::json!({"Age": 10})),
            EnforceArg::from("/data"),
            EnforceArg::from("read"),
        ])
        .unwrap();
    assert!(!minor);
}

#[test]
fn abac_with_serialized_record() {
    #[derive(serde::Serialize)]
    struct Subject {
        #[serde(rename = "Age")]
        age: u32,
    }

    let e = enforcer(ABAC_MODEL, &[&["p", "_", "/data", "read"]]);
    let subject = Value::record(&Subject { age: 20 }).unwrap();
    let allowed = e
        .enforce([
            EnforceArg::from(subject),
            EnforceArg::from("/data"),
            EnforceArg::from("read"),
        ])
        .unwrap();
    assert!(allowed);
}

#[test]
fn filter_returns_considered_rules() {
    let e = enforcer(
        BASIC_MODEL,
        &[
            &["p", "alice", "data1", "read"],
            &["p", "alice", "data2", "read"],
            &["p", "bob", "data2", "write"],
        ],
    );

    // matcher override: everything alice may touch
    let mut matched = e
        .filter([
            EnforceArg::from(ContextOption::matcher("p.sub == 'alice'")),
        ])
        .unwrap();
    matched.sort();
    assert_eq!(
        matched,
        vec![
            rule(&["p", "alice", "data1", "read"]),
            rule(&["p", "alice", "data2", "read"]),
        ]
    );

    // default matcher: filter agrees with what enforce considers
    let matched = e
        .filter([
            EnforceArg::from("alice"),
            EnforceArg::from("data1"),
            EnforceArg::from("read"),
        ])
        .unwrap();
    assert_eq!(matched, vec![rule(&["p", "alice", "data1", "read"])]);
    assert!(e.enforce_request(["alice", "data1", "read"]).unwrap());
}

#[test]
fn filter_over_role_rules() {
    let e = enforcer(
        DOMAIN_MODEL,
        &[
            &["p", "admin", "domain1", "data1", "read"],
            &["g", "alice", "admin", "domain1"],
            &["g", "bob", "admin", "domain2"],
        ],
    );

    let matched = e
        .filter([EnforceArg::from(ContextOption::matcher(
            "g.domain == 'domain1'",
        ))])
        .unwrap();
    assert_eq!(matched, vec![rule(&["g", "alice", "admin", "domain1"])]);
}

#[test]
fn range_matches_streams_and_stops() {
    let e = enforcer(
        BASIC_MODEL,
        &[
            &["p", "alice", "data1", "read"],
            &["p", "bob", "data2", "write"],
        ],
    );

    let mut seen: Vec<Rule> = Vec::new();
    e.range_matches(
        [EnforceArg::from(ContextOption::matcher("true"))],
        |rule| {
            seen.push(rule.to_vec());
            false
        },
    )
    .unwrap();
    assert_eq!(seen.len(), 1);
}

#[test]
fn inline_effector_and_request_def() {
    let e = enforcer(
        DENY_MODEL,
        &[
            &["p", "alice", "data1", "read", "allow"],
            &["p", "alice", "data1", "read", "deny"],
        ],
    );

    // the allow-and-deny form also denies here: a deny rule matches
    let allowed = e
        .enforce([
            EnforceArg::from(ContextOption::effector(
                "some(where (p.eft == allow)) && !some(where (p.eft == deny))",
            )),
            EnforceArg::from("alice"),
            EnforceArg::from("data1"),
            EnforceArg::from("read"),
        ])
        .unwrap();
    assert!(!allowed);

    // single-field request definition under a custom key
    let e = enforcer(BASIC_MODEL, &[&["p", "alice", "data1", "read"]]);
    let allowed = e
        .enforce([
            EnforceArg::from(ContextOption::matcher("r5.sub == p.sub")),
            EnforceArg::from(ContextOption::request_def_inline("r5", "sub")),
            EnforceArg::from("alice"),
        ])
        .unwrap();
    assert!(allowed);
}

#[test]
fn enforcement_error_is_not_a_policy_deny() {
    let e = enforcer(BASIC_MODEL, &[&["p", "alice", "data1", "read"]]);

    // request tuple shorter than the definition
    let res = e.enforce_request(["alice"]);
    assert!(res.is_err());

    // unknown effect expression
    let res = e.enforce([
        EnforceArg::from(ContextOption::effector("priority(p.eft)")),
        EnforceArg::from("alice"),
        EnforceArg::from("data1"),
        EnforceArg::from("read"),
    ]);
    assert!(res.is_err());
}

#[test]
fn eval_matcher_reads_rules_as_expressions() {
    const EVAL_MODEL: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub_rule, obj, act

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = eval(p.sub_rule) && r.obj == p.obj && r.act == p.act
"#;

    let e = Enforcer::new(Model::from_text(EVAL_MODEL).unwrap(), ()).unwrap();
    e.add_rule(&rule(&[
        "p",
        "r.sub.Age > 60 && r.sub.Age < 100",
        "/data1",
        "read",
    ]))
    .unwrap();

    let senior = e
        .enforce([
            EnforceArg::from(serde_json::json!({"Age": 70})),
            EnforceArg::from("/data1"),
            EnforceArg::from("read"),
        ])
        .unwrap();
    assert!(senior);

    let junior = e
        .enforce([
            EnforceArg::from(serde_json::json!({"Age": 30})),
            EnforceArg::from("/data1"),
            EnforceArg::from("read"),
        ])
        .unwrap();
    assert!(!junior);
}

#[test]
fn pattern_roles_with_prefix_matcher() {
    let e = enforcer(
        PATH_MODEL.replace(
            "m = r.sub == p.sub && pathMatch(r.obj, p.obj) && r.act == p.act",
            "m = g(r.sub, p.sub) && pathMatch(r.obj, p.obj) && r.act == p.act",
        )
        .replace(
            "[policy_effect]",
            "[role_definition]\ng = _, _\n\n[policy_effect]",
        )
        .as_str(),
        &[
            &["p", "role:user", "/user/:uid/entry/:eid", "GET"],
            &["p", "user:alice", "/user/alice/*", "POST"],
            &["p", "role:admin", "/user/:uid/entry/:eid", "DELETE"],
            &["g", "reg:user:.*", "role:user"],
            &["g", "user:alice", "role:admin"],
        ],
    );

    let rm = e.get_model().get_role_manager("g").unwrap();
    rm.set_matcher(functions::regex_name_matcher("reg:"));

    assert_requests(
        &e,
        &[
            (&["user:alice", "/user/joe/entry/1", "GET"], true),
            (&["user:alice", "/user/alice/entry/2", "POST"], true),
            (&["user:alice", "/user/bob/entry/3", "POST"], false),
            (&["user:alice", "/user/bob/entry/3", "DELETE"], true),
            (&["user:bob", "/user/alice/entry/2", "DELETE"], false),
        ],
    );
}

#[test]
fn managing_rules_through_filters() {
    let e = enforcer(
        RBAC_MODEL,
        &[
            &["p", "alice", "data1", "read"],
            &["p", "bob", "data2", "read"],
            &["p", "manager", "data3", "write"],
            &["g", "bob", "manager"],
        ],
    );

    // remove all of bob's rules, grouping rules included
    let bob_rules = e
        .filter([EnforceArg::from(ContextOption::matcher("p.sub == 'bob'"))])
        .unwrap();
    let bob_groups = e
        .filter([EnforceArg::from(ContextOption::matcher("g.user == 'bob'"))])
        .unwrap();
    let mut doomed = bob_rules;
    doomed.extend(bob_groups);
    e.remove_rules(&doomed).unwrap();

    assert!(e.add_rule(&rule(&["g", "alice", "manager"])).unwrap());

    let mut remaining = Vec::new();
    e.get_model().range_rules(&mut |r| {
        remaining.push(r.join(", "));
        true
    });
    remaining.sort();
    assert_eq!(
        remaining,
        vec![
            "g, alice, manager",
            "p, alice, data1, read",
            "p, manager, data3, write",
        ]
    );
    assert!(e.enforce_request(["alice", "data3", "write"]).unwrap());
}
