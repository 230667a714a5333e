//! In-memory model of the cross-session filter aggregation.
//!
//! Replicates the multiplexer's semantics — per-session bounded multicast
//! sets with lenient overshoot, a deduplicated union over active sessions,
//! and reference-counted promiscuous mode — and verifies after every
//! operation that the "hardware-visible" state matches what a naive
//! recomputation says it should be.

use std::collections::{BTreeMap, BTreeSet};

use ethmux_core::{MacAddr, MAX_MULTICAST_FILTERS, MULTICAST_MAX_PER_SESSION};

/// Hardware calls the model records, mirroring `Param`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HwCall {
    Promiscuous(bool),
    Filter(Vec<MacAddr>),
    Overflow,
}

#[derive(Debug, Default, Clone)]
struct SessionFilters {
    promisc: bool,
    addrs: Vec<MacAddr>,
    count: usize,
}

impl SessionFilters {
    fn add(&mut self, addr: MacAddr) {
        if self.addrs.contains(&addr) {
            return;
        }
        if self.addrs.len() < MULTICAST_MAX_PER_SESSION && self.count == self.addrs.len() {
            self.addrs.push(addr);
        }
        self.count += 1;
    }

    fn remove(&mut self, addr: &MacAddr) {
        if let Some(pos) = self.addrs.iter().position(|a| a == addr) {
            self.addrs.remove(pos);
            self.count -= 1;
        } else if self.count > self.addrs.len() {
            self.count -= 1;
        }
    }

    fn overflowed(&self) -> bool {
        self.count > self.addrs.len()
    }
}

/// Operations the fuzzer drives. Sessions are dense small ids; addresses
/// are derived from a byte.
#[derive(Clone, Copy, Debug)]
pub enum FilterOp {
    Add { session: u8, addr: u8 },
    Remove { session: u8, addr: u8 },
    Activate { session: u8 },
    Deactivate { session: u8 },
    PromiscOn { session: u8 },
    PromiscOff { session: u8 },
}

/// Number of distinct sessions the fuzzer uses.
pub const SESSION_COUNT: u8 = 4;

fn addr_of(n: u8) -> MacAddr {
    MacAddr([0x01, 0x00, 0x5e, 0x00, 0x00, n])
}

/// Model of the multiplexer's aggregate filter state.
#[derive(Default)]
pub struct FilterModel {
    sessions: BTreeMap<u8, SessionFilters>,
    active: BTreeSet<u8>,
    promisc_count: usize,
    hw: Vec<HwCall>,
}

impl FilterModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn session(&mut self, id: u8) -> &mut SessionFilters {
        self.sessions.entry(id % SESSION_COUNT).or_default()
    }

    fn push_union(&mut self) {
        let mut union: BTreeSet<MacAddr> = BTreeSet::new();
        let mut overflow = false;
        for id in &self.active {
            if let Some(s) = self.sessions.get(id) {
                overflow |= s.overflowed();
                union.extend(s.addrs.iter().copied());
            }
        }
        if union.len() > MAX_MULTICAST_FILTERS {
            overflow = true;
        }
        self.hw.push(if overflow {
            HwCall::Overflow
        } else {
            HwCall::Filter(union.into_iter().collect())
        });
    }

    pub fn apply(&mut self, op: FilterOp) {
        match op {
            FilterOp::Add { session, addr } => {
                self.session(session).add(addr_of(addr));
                if self.active.contains(&(session % SESSION_COUNT)) {
                    self.push_union();
                }
            }
            FilterOp::Remove { session, addr } => {
                self.session(session).remove(&addr_of(addr));
                if self.active.contains(&(session % SESSION_COUNT)) {
                    self.push_union();
                }
            }
            FilterOp::Activate { session } => {
                let id = session % SESSION_COUNT;
                self.session(id);
                if self.active.insert(id) {
                    self.push_union();
                }
            }
            FilterOp::Deactivate { session } => {
                let id = session % SESSION_COUNT;
                if self.active.remove(&id) {
                    // Stop unwinds the promiscuous contribution too.
                    let had = std::mem::take(&mut self.session(id).promisc);
                    if had {
                        self.promisc_count -= 1;
                        if self.promisc_count == 0 {
                            self.hw.push(HwCall::Promiscuous(false));
                        }
                    }
                    self.push_union();
                }
            }
            FilterOp::PromiscOn { session } => {
                let s = self.session(session);
                if !s.promisc {
                    s.promisc = true;
                    if self.promisc_count == 0 {
                        self.hw.push(HwCall::Promiscuous(true));
                    }
                    self.promisc_count += 1;
                }
            }
            FilterOp::PromiscOff { session } => {
                let s = self.session(session);
                if s.promisc {
                    s.promisc = false;
                    self.promisc_count -= 1;
                    if self.promisc_count == 0 {
                        self.hw.push(HwCall::Promiscuous(false));
                    }
                }
            }
        }
    }

    fn expected_union(&self) -> (BTreeSet<MacAddr>, bool) {
        let mut union = BTreeSet::new();
        let mut overflow = false;
        for id in &self.active {
            if let Some(s) = self.sessions.get(id) {
                overflow |= s.overflowed();
                union.extend(s.addrs.iter().copied());
            }
        }
        overflow |= union.len() > MAX_MULTICAST_FILTERS;
        (union, overflow)
    }

    /// Check every aggregate invariant.
    pub fn verify(&self, step: usize) -> Result<(), String> {
        // Promiscuous refcount matches the flags.
        let flagged = self.sessions.values().filter(|s| s.promisc).count();
        if flagged != self.promisc_count {
            return Err(format!(
                "step {step}: promisc count {} != flagged sessions {flagged}",
                self.promisc_count
            ));
        }

        // Hardware promiscuous state is the last Promiscuous call, and must
        // equal (count > 0). Consecutive calls always alternate.
        let mut hw_promisc = false;
        let mut last: Option<bool> = None;
        for call in &self.hw {
            if let HwCall::Promiscuous(on) = call {
                if last == Some(*on) {
                    return Err(format!(
                        "step {step}: duplicate hardware promiscuous({on}) call"
                    ));
                }
                last = Some(*on);
                hw_promisc = *on;
            }
        }
        if hw_promisc != (self.promisc_count > 0) {
            return Err(format!(
                "step {step}: hardware promisc {hw_promisc} but {} requesters",
                self.promisc_count
            ));
        }

        // Per-session bounds.
        for (id, s) in &self.sessions {
            if s.addrs.len() > MULTICAST_MAX_PER_SESSION {
                return Err(format!("step {step}: session {id} stores too many addresses"));
            }
            if s.count < s.addrs.len() {
                return Err(format!("step {step}: session {id} count below stored list"));
            }
            let dedup: BTreeSet<_> = s.addrs.iter().collect();
            if dedup.len() != s.addrs.len() {
                return Err(format!("step {step}: session {id} stores duplicates"));
            }
        }

        // The last filter push matches a fresh recomputation.
        let (union, overflow) = self.expected_union();
        let last_filter = self.hw.iter().rev().find_map(|c| match c {
            HwCall::Filter(list) => Some(Ok(list.clone())),
            HwCall::Overflow => Some(Err(())),
            HwCall::Promiscuous(_) => None,
        });
        match last_filter {
            Some(Ok(list)) => {
                if overflow {
                    return Err(format!(
                        "step {step}: hardware has a filter list but union overflowed"
                    ));
                }
                let got: BTreeSet<MacAddr> = list.into_iter().collect();
                if got != union {
                    return Err(format!("step {step}: hardware filter diverged from union"));
                }
            }
            Some(Err(())) => {
                if !overflow {
                    return Err(format!(
                        "step {step}: hardware in overflow but union fits"
                    ));
                }
            }
            None => {
                // No push yet: the active set was never touched, so the
                // union must still be trivial.
                if !union.is_empty() || overflow {
                    return Err(format!(
                        "step {step}: union populated but never pushed"
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Run an operation sequence, checking invariants after every step.
pub fn execute_and_verify(ops: &[FilterOp]) -> Result<(), String> {
    let mut model = FilterModel::new();
    for (i, op) in ops.iter().enumerate() {
        model.apply(*op);
        model.verify(i)?;
    }
    Ok(())
}
