//! Host-packet-filter back-end (§4.4.2), programming an nftables `inet`
//! table. Call shapes (`Batch`, `NfCmd`, `Chain`, `Rule`, `Table`,
//! `Statement`, the `capctl::ambient::raise/lower(Cap::NET_ADMIN)`
//! wrapping, comment-tagged rule lookup for removal) are ported directly
//! from `examples/tangle-network-blueprint/crates/manager/src/rt/hypervisor/net/nftables.rs`,
//! generalized from "one tap interface, one VM" to "one chain per
//! instance, rules derived from that instance's bound security groups."

use crate::error::{Error, Result};
use crate::filter::FilterEngine;
use crate::model::{Cidr, Instance, Protocol, SecurityGroup};
use async_trait::async_trait;
use capctl::{Cap, CapState};
use nftables::batch::Batch;
use nftables::expr::{Expression, NamedExpression, Payload, PayloadField, Prefix};
use nftables::schema::{Chain, NfCmd, NfListObject, NfObject, Rule, Table};
use nftables::stmt::{Accept, Drop, JumpTarget, Match, Operator, Statement};
use nftables::types::{NfChainPolicy, NfChainType, NfFamily, NfHook};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::instrument;

const TABLE: &str = "compute_sg";
const FORWARD_CHAIN: &str = "COMPUTE_FORWARD";
const FALLBACK_CHAIN: &str = "sg-fallback";
const PRIORITY_FILTER: i32 = 0;

fn instance_chain(instance: &Instance) -> String {
    format!("inst-{}", instance.id)
}

fn with_net_admin<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    capctl::ambient::raise(Cap::NET_ADMIN)?;
    let result = f();
    capctl::ambient::lower(Cap::NET_ADMIN)?;
    result
}

pub fn check_net_admin_capability() -> Result<()> {
    let mut state = CapState::get_current()
        .map_err(|_| Error::NotAuthorized("unable to read current thread capabilities".into()))?;
    if state.effective.has(Cap::NET_ADMIN) {
        state.inheritable.add(Cap::NET_ADMIN);
        state.set_current()?;
        Ok(())
    } else {
        Err(Error::NotAuthorized(
            "binary is missing the CAP_NET_ADMIN capability".into(),
        ))
    }
}

fn setup_chains_if_needed() -> Result<()> {
    let mut batch = Batch::new();
    batch.add_cmd(NfCmd::Add(NfListObject::Table(Table {
        family: NfFamily::INet,
        name: TABLE.into(),
        ..Default::default()
    })));
    batch.add_cmd(NfCmd::Add(NfListObject::Chain(Chain {
        family: NfFamily::INet,
        table: TABLE.into(),
        name: FORWARD_CHAIN.into(),
        _type: Some(NfChainType::Filter),
        hook: Some(NfHook::Forward),
        policy: Some(NfChainPolicy::Accept),
        prio: Some(PRIORITY_FILTER),
        ..Default::default()
    })));
    batch.add_cmd(NfCmd::Add(NfListObject::Chain(Chain {
        family: NfFamily::INet,
        table: TABLE.into(),
        name: FALLBACK_CHAIN.into(),
        ..Default::default()
    })));
    batch.add_cmd(NfCmd::Add(NfListObject::Rule(Rule {
        family: NfFamily::INet,
        table: Cow::from(TABLE),
        chain: Cow::from(FALLBACK_CHAIN),
        expr: Cow::from(vec![Statement::Drop(Some(Drop {}))]),
        handle: None,
        index: None,
        comment: Some("sg-fallback-drop".into()),
    })));
    nftables::helper::apply_ruleset(&batch.to_nftables())?;
    Ok(())
}

fn addr_match(protocol: &'static str, field: &'static str, value: String) -> Statement<'static> {
    Statement::Match(Match {
        left: Expression::Named(NamedExpression::Payload(Payload::PayloadField(PayloadField {
            protocol: protocol.into(),
            field: field.into(),
        }))),
        op: Operator::EQ,
        right: Expression::String(Cow::from(value)),
    })
}

fn prefix_match(protocol: &'static str, field: &'static str, addr: String, len: u32) -> Statement<'static> {
    Statement::Match(Match {
        left: Expression::Named(NamedExpression::Payload(Payload::PayloadField(PayloadField {
            protocol: protocol.into(),
            field: field.into(),
        }))),
        op: Operator::EQ,
        right: Expression::Named(NamedExpression::Prefix(Prefix {
            addr: Box::new(Expression::String(Cow::from(addr))),
            len,
        })),
    })
}

fn port_statements(from_port: i32, to_port: i32, protocol: &'static str) -> Vec<Statement<'static>> {
    if from_port == to_port {
        vec![Statement::Match(Match {
            left: Expression::Named(NamedExpression::Payload(Payload::PayloadField(PayloadField {
                protocol,
                field: "dport".into(),
            }))),
            op: Operator::EQ,
            right: Expression::Number(from_port as u32),
        })]
    } else {
        vec![Statement::Match(Match {
            left: Expression::Named(NamedExpression::Payload(Payload::PayloadField(PayloadField {
                protocol,
                field: "dport".into(),
            }))),
            op: Operator::EQ,
            right: Expression::Range(Box::new([
                Expression::Number(from_port as u32),
                Expression::Number(to_port as u32),
            ])),
        })]
    }
}

fn icmp_statements(from_type: i32, to_code: i32, protocol: &'static str) -> Vec<Statement<'static>> {
    let mut out = Vec::new();
    if from_type != -1 {
        out.push(Statement::Match(Match {
            left: Expression::Named(NamedExpression::Payload(Payload::PayloadField(PayloadField {
                protocol,
                field: "type".into(),
            }))),
            op: Operator::EQ,
            right: Expression::Number(from_type as u32),
        }));
    }
    if from_type != -1 && to_code != -1 {
        out.push(Statement::Match(Match {
            left: Expression::Named(NamedExpression::Payload(Payload::PayloadField(PayloadField {
                protocol,
                field: "code".into(),
            }))),
            op: Operator::EQ,
            right: Expression::Number(to_code as u32),
        }));
    }
    out
}

/// Builds the ordered rule list for one instance chain (§4.4.2 steps 1-7).
fn instance_chain_rules<'a>(
    chain: &'a str,
    groups: &[SecurityGroup],
    net: &crate::model::NetworkInfo,
    allow_project_net_traffic: bool,
    use_ipv6: bool,
) -> Vec<Rule<'a>> {
    let mut rules = Vec::new();

    rules.push(Rule {
        family: NfFamily::INet,
        table: Cow::from(TABLE),
        chain: Cow::from(chain),
        expr: Cow::from(vec![
            Statement::Match(Match {
                left: Expression::Named(NamedExpression::CT(nftables::expr::CT {
                    key: Cow::from("state"),
                    ..Default::default()
                })),
                op: Operator::EQ,
                right: Expression::String(Cow::from("invalid")),
            }),
            Statement::Drop(Some(Drop {})),
        ]),
        handle: None,
        index: None,
        comment: Some(format!("{chain}-invalid-drop").into()),
    });

    rules.push(Rule {
        family: NfFamily::INet,
        table: Cow::from(TABLE),
        chain: Cow::from(chain),
        expr: Cow::from(vec![
            Statement::Match(Match {
                left: Expression::Named(NamedExpression::CT(nftables::expr::CT {
                    key: Cow::from("state"),
                    ..Default::default()
                })),
                op: Operator::IN,
                right: Expression::Named(NamedExpression::Set(vec![
                    nftables::expr::SetItem::Element(Expression::String(Cow::from("established"))),
                    nftables::expr::SetItem::Element(Expression::String(Cow::from("related"))),
                ])),
            }),
            Statement::Accept(Some(Accept {})),
        ]),
        handle: None,
        index: None,
        comment: Some(format!("{chain}-established").into()),
    });

    if let Some(dhcp) = net.dhcp_server {
        rules.push(Rule {
            family: NfFamily::INet,
            table: Cow::from(TABLE),
            chain: Cow::from(chain),
            expr: Cow::from(vec![
                addr_match("ip", "saddr", dhcp.to_string()),
                Statement::Accept(Some(Accept {})),
            ]),
            handle: None,
            index: None,
            comment: Some(format!("{chain}-dhcp").into()),
        });
    }

    if allow_project_net_traffic {
        if let Some(cidr) = net.cidr {
            rules.push(Rule {
                family: NfFamily::INet,
                table: Cow::from(TABLE),
                chain: Cow::from(chain),
                expr: Cow::from(vec![
                    prefix_match("ip", "saddr", cidr.network().to_string(), u32::from(cidr.prefix_len())),
                    Statement::Accept(Some(Accept {})),
                ]),
                handle: None,
                index: None,
                comment: Some(format!("{chain}-project-v4").into()),
            });
        }
        if use_ipv6 {
            if let Some(cidr6) = net.cidr_v6 {
                rules.push(Rule {
                    family: NfFamily::INet,
                    table: Cow::from(TABLE),
                    chain: Cow::from(chain),
                    expr: Cow::from(vec![
                        prefix_match("ip6", "saddr", cidr6.network().to_string(), u32::from(cidr6.prefix_len())),
                        Statement::Accept(Some(Accept {})),
                    ]),
                    handle: None,
                    index: None,
                    comment: Some(format!("{chain}-project-v6").into()),
                });
            }
        }
    }

    if use_ipv6 {
        if let Some(gw6) = net.gateway_v6 {
            rules.push(Rule {
                family: NfFamily::INet,
                table: Cow::from(TABLE),
                chain: Cow::from(chain),
                expr: Cow::from(vec![
                    addr_match("ip6", "saddr", gw6.to_string()),
                    Statement::Accept(Some(Accept {})),
                ]),
                handle: None,
                index: None,
                comment: Some(format!("{chain}-ra").into()),
            });
        }
    }

    for group in groups {
        for rule in &group.rules {
            let Some(cidr) = &rule.cidr else { continue };
            let (family_proto, addr, len) = match cidr {
                Cidr::V4(net) => ("ip", net.network().to_string(), u32::from(net.prefix_len())),
                Cidr::V6(net) => ("ip6", net.network().to_string(), u32::from(net.prefix_len())),
            };
            let mut expr = vec![prefix_match(family_proto, "saddr", addr, len)];
            match rule.protocol {
                Protocol::Tcp => expr.extend(port_statements(rule.from_port, rule.to_port, "tcp")),
                Protocol::Udp => expr.extend(port_statements(rule.from_port, rule.to_port, "udp")),
                Protocol::Icmp => {
                    let proto = if cidr.is_v6() { "icmpv6" } else { "icmp" };
                    expr.extend(icmp_statements(rule.from_port, rule.to_port, proto));
                }
            }
            expr.push(Statement::Accept(Some(Accept {})));
            rules.push(Rule {
                family: NfFamily::INet,
                table: Cow::from(TABLE),
                chain: Cow::from(chain),
                expr: Cow::from(expr),
                handle: None,
                index: None,
                comment: Some(format!("{chain}-sg-{}", group.id).into()),
            });
        }
    }

    rules.push(Rule {
        family: NfFamily::INet,
        table: Cow::from(TABLE),
        chain: Cow::from(chain),
        expr: Cow::from(vec![Statement::Jump(JumpTarget {
            target: Cow::from(FALLBACK_CHAIN),
        })]),
        handle: None,
        index: None,
        comment: Some(format!("{chain}-fallback").into()),
    });

    rules
}

/// Removes every existing rule in `chain`, found by `chain-*` comment
/// prefix, under the engine lock (§5 "remove-all-then-add-all").
fn remove_chain_rules(chain: &str) -> Result<()> {
    let current = nftables::helper::get_current_ruleset()?;
    let mut handles = Vec::new();
    for obj in &*current.objects {
        let NfObject::ListObject(NfListObject::Rule(rule)) = obj else {
            continue;
        };
        if rule.table != TABLE {
            continue;
        }
        if let Some(comment) = &rule.comment {
            if comment.starts_with(&format!("{chain}-")) {
                handles.push(rule.handle);
            }
        }
    }

    let mut batch = Batch::new();
    for handle in handles.into_iter().flatten() {
        batch.add_cmd(NfCmd::Delete(NfListObject::Rule(Rule {
            family: NfFamily::INet,
            table: Cow::from(TABLE),
            chain: Cow::from(chain.to_string()),
            expr: Cow::from(vec![]),
            handle: Some(handle),
            index: None,
            comment: None,
        })));
    }
    if !batch.to_nftables().objects.is_empty() {
        nftables::helper::apply_ruleset(&batch.to_nftables())?;
    }
    Ok(())
}

pub struct HostFilterEngine {
    store: Arc<dyn crate::store::InstanceStore>,
    allow_project_net_traffic: bool,
    use_ipv6: bool,
    static_initialized: Mutex<bool>,
    /// Engine-level lock (§5): rule refresh runs remove-then-add under it.
    lock: Mutex<()>,
    chains: Mutex<HashMap<String, String>>,
}

impl HostFilterEngine {
    pub fn new(
        store: Arc<dyn crate::store::InstanceStore>,
        allow_project_net_traffic: bool,
        use_ipv6: bool,
    ) -> Self {
        Self {
            store,
            allow_project_net_traffic,
            use_ipv6,
            static_initialized: Mutex::new(false),
            lock: Mutex::new(()),
            chains: Mutex::new(HashMap::new()),
        }
    }

    async fn program_instance_chain(&self, instance: &Instance) -> Result<()> {
        let _guard = self.lock.lock().await;
        let chain = instance_chain(instance);
        let groups = self.store.security_group_get_by_instance(instance.id).await?;
        let net = self.store.network_get_by_instance(instance.id).await?;

        let allow_project = self.allow_project_net_traffic;
        let use_ipv6 = self.use_ipv6;
        let chain_owned = chain.clone();
        let groups_owned = groups.clone();
        let net_owned = net.clone();
        tokio::task::spawn_blocking(move || {
            with_net_admin(|| {
                let mut batch = Batch::new();
                batch.add_cmd(NfCmd::Add(NfListObject::Chain(Chain {
                    family: NfFamily::INet,
                    table: TABLE.into(),
                    name: chain_owned.clone().into(),
                    ..Default::default()
                })));
                nftables::helper::apply_ruleset(&batch.to_nftables())?;

                remove_chain_rules(&chain_owned)?;

                let rules = instance_chain_rules(&chain_owned, &groups_owned, &net_owned, allow_project, use_ipv6);
                let mut batch = Batch::new();
                for rule in rules {
                    batch.add_cmd(NfCmd::Add(NfListObject::Rule(rule)));
                }
                nftables::helper::apply_ruleset(&batch.to_nftables())?;
                Ok(())
            })
        })
        .await
        .map_err(|e| Error::Fatal(format!("nftables task panicked: {e}")))??;

        self.chains.lock().await.insert(instance.name.clone(), chain);
        Ok(())
    }
}

#[async_trait]
impl FilterEngine for HostFilterEngine {
    #[instrument(skip(self, instance))]
    async fn setup_basic_filtering(&self, instance: &Instance) -> Result<()> {
        let mut initialized = self.static_initialized.lock().await;
        if *initialized {
            return Ok(());
        }
        tokio::task::spawn_blocking(|| with_net_admin(setup_chains_if_needed))
            .await
            .map_err(|e| Error::Fatal(format!("nftables task panicked: {e}")))??;
        *initialized = true;
        let _ = instance;
        Ok(())
    }

    #[instrument(skip(self, instance))]
    async fn prepare_instance_filter(&self, instance: &Instance) -> Result<()> {
        self.program_instance_chain(instance).await
    }

    #[instrument(skip(self, instance))]
    async fn apply_instance_filter(&self, instance: &Instance) -> Result<()> {
        // Rules are active as soon as they're programmed; nothing further
        // to activate once the chain is jumped to from `COMPUTE_FORWARD`
        // (wiring the jump rule happens here, scoped to the instance's
        // current fixed address).
        let Some(addr) = self.store.instance_get_fixed_address(instance.id).await? else {
            return Ok(());
        };
        let chain = instance_chain(instance);
        tokio::task::spawn_blocking(move || {
            with_net_admin(|| {
                let mut batch = Batch::new();
                batch.add_cmd(NfCmd::Add(NfListObject::Rule(Rule {
                    family: NfFamily::INet,
                    table: Cow::from(TABLE),
                    chain: Cow::from(FORWARD_CHAIN),
                    expr: Cow::from(vec![
                        prefix_match("ip", "daddr", addr.to_string(), 32),
                        Statement::Jump(JumpTarget {
                            target: Cow::from(chain.clone()),
                        }),
                    ]),
                    handle: None,
                    index: None,
                    comment: Some(format!("{chain}-dispatch").into()),
                })));
                nftables::helper::apply_ruleset(&batch.to_nftables())?;
                Ok(())
            })
        })
        .await
        .map_err(|e| Error::Fatal(format!("nftables task panicked: {e}")))?
    }

    #[instrument(skip(self, instance))]
    async fn unfilter_instance(&self, instance: &Instance) -> Result<()> {
        let chain = instance_chain(instance);
        tokio::task::spawn_blocking(move || {
            with_net_admin(|| {
                remove_chain_rules(&chain)?;
                remove_chain_rules(FORWARD_CHAIN)?;
                let mut batch = Batch::new();
                batch.add_cmd(NfCmd::Delete(NfListObject::Chain(Chain {
                    family: NfFamily::INet,
                    table: TABLE.into(),
                    name: chain.into(),
                    ..Default::default()
                })));
                nftables::helper::apply_ruleset(&batch.to_nftables())?;
                Ok(())
            })
        })
        .await
        .map_err(|e| Error::Fatal(format!("nftables task panicked: {e}")))??;
        self.chains.lock().await.remove(&instance.name);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn refresh_security_group_rules(&self, sg_id: u64) -> Result<()> {
        // Every instance bound to `sg_id` gets its chain rebuilt
        // (remove-all-then-add-all) under the engine lock.
        let instances = self.store.instance_get_all_by_security_group(sg_id).await?;
        for instance in &instances {
            self.program_instance_chain(instance).await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn refresh_security_group_members(&self, sg_id: u64) -> Result<()> {
        self.refresh_security_group_rules(sg_id).await
    }

    async fn instance_filter_exists(&self, instance: &Instance) -> Result<bool> {
        Ok(self.chains.lock().await.contains_key(&instance.name))
    }
}
