//! Per-URL bandwidth throttling: glob-pattern rules, EMA rate smoothing,
//! and periodic redistribution of bandwidth across bound connections.

use std::collections::HashMap;

use crate::conn::ConnId;
use crate::glob::glob_match;

pub const MAXTHROTTLENUMS: usize = 10;
pub const THROTTLE_TIME_SECS: u64 = 5;

pub struct ThrottleRule {
    pub pattern: String,
    pub max_limit: u64,
    pub min_limit: u64,
    pub rate: f64,
    pub bytes_since_avg: u64,
    pub bound: Vec<ConnId>,
}

pub struct ThrottleTable {
    rules: Vec<ThrottleRule>,
}

#[derive(Debug, Clone, Copy)]
pub struct ThrottleBinding {
    pub max_limit: u64,
    pub min_limit: u64,
    pub rule_indices: [Option<usize>; MAXTHROTTLENUMS],
}

impl ThrottleTable {
    pub fn new(rules: Vec<(String, u64, u64)>) -> Self {
        let rules = rules
            .into_iter()
            .map(|(pattern, max_limit, min_limit)| ThrottleRule {
                pattern,
                max_limit,
                min_limit,
                rate: 0.0,
                bytes_since_avg: 0,
                bound: Vec::new(),
            })
            .collect();
        Self { rules }
    }

    /// Finds every rule whose glob matches `filename`, capped at
    /// `MAXTHROTTLENUMS`. Returns `None` (meaning "reject with 503") if any
    /// matching rule's current rate is more than double its max limit or
    /// below its configured minimum. On success, binds `conn` to each
    /// matching rule and returns the connection's effective budget.
    pub fn bind(&mut self, filename: &str, conn: ConnId) -> Option<ThrottleBinding> {
        let matches: Vec<usize> = self
            .rules
            .iter()
            .enumerate()
            .filter(|(_, r)| glob_match(&r.pattern, filename))
            .map(|(i, _)| i)
            .take(MAXTHROTTLENUMS)
            .collect();

        if matches.is_empty() {
            return Some(ThrottleBinding {
                max_limit: u64::MAX,
                min_limit: 0,
                rule_indices: [None; MAXTHROTTLENUMS],
            });
        }

        for &idx in &matches {
            let r = &self.rules[idx];
            if r.rate > 2.0 * r.max_limit as f64 || r.rate < r.min_limit as f64 {
                return None;
            }
        }

        let mut max_limit = u64::MAX;
        let mut min_limit = 0u64;
        for &idx in &matches {
            let r = &mut self.rules[idx];
            r.bound.push(conn);
            let share = r.max_limit / (r.bound.len() as u64).max(1);
            max_limit = max_limit.min(share);
            min_limit = min_limit.max(r.min_limit);
        }

        let mut rule_indices = [None; MAXTHROTTLENUMS];
        for (slot, idx) in rule_indices.iter_mut().zip(matches.iter()) {
            *slot = Some(*idx);
        }

        Some(ThrottleBinding { max_limit, min_limit, rule_indices })
    }

    pub fn unbind(&mut self, binding: &ThrottleBinding, conn: ConnId) {
        for idx in binding.rule_indices.iter().flatten() {
            self.rules[*idx].bound.retain(|&c| c != conn);
        }
    }

    pub fn record_bytes(&mut self, binding: &ThrottleBinding, bytes: u64) {
        for idx in binding.rule_indices.iter().flatten() {
            self.rules[*idx].bytes_since_avg += bytes;
        }
    }

    /// EMA-smooths each rule's rate against the bytes it moved this period.
    /// Does not touch any bound connection's cached share; call
    /// [`rebalance`](Self::rebalance) alongside this to redivide shares.
    pub fn periodic_update(&mut self) {
        for rule in &mut self.rules {
            let instantaneous = rule.bytes_since_avg as f64 / THROTTLE_TIME_SECS as f64;
            rule.rate = (2.0 * rule.rate + instantaneous) / 3.0;
            rule.bytes_since_avg = 0;

            if rule.rate > 2.0 * rule.max_limit as f64 {
                tracing::warn!(pattern = %rule.pattern, rate = rule.rate, "throttle rule over limit");
            } else if rule.rate < rule.min_limit as f64 {
                tracing::warn!(pattern = %rule.pattern, rate = rule.rate, "throttle rule under minimum");
            }
        }
    }

    /// Recomputes every currently bound connection's effective
    /// `ThrottleBinding` by redividing each rule's max limit among however
    /// many connections are bound to it right now, mirroring `bind`'s
    /// share-division. The caller writes each returned binding back onto
    /// its live `Connection`.
    pub fn rebalance(&mut self) -> Vec<(ConnId, ThrottleBinding)> {
        let mut per_conn: HashMap<ConnId, Vec<usize>> = HashMap::new();
        for (idx, rule) in self.rules.iter().enumerate() {
            for &conn in &rule.bound {
                per_conn.entry(conn).or_default().push(idx);
            }
        }

        let mut out = Vec::with_capacity(per_conn.len());
        for (conn, idxs) in per_conn {
            let mut max_limit = u64::MAX;
            let mut min_limit = 0u64;
            let mut rule_indices = [None; MAXTHROTTLENUMS];
            for (slot, &idx) in rule_indices.iter_mut().zip(idxs.iter()) {
                *slot = Some(idx);
                let r = &self.rules[idx];
                let share = r.max_limit / (r.bound.len() as u64).max(1);
                max_limit = max_limit.min(share);
                min_limit = min_limit.max(r.min_limit);
            }
            out.push((conn, ThrottleBinding { max_limit, min_limit, rule_indices }));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmatched_file_gets_unbounded_budget() {
        let mut table = ThrottleTable::new(vec![("*.cgi".to_string(), 1000, 0)]);
        let binding = table.bind("/static/a.html", ConnId(0)).unwrap();
        assert_eq!(binding.max_limit, u64::MAX);
    }

    #[test]
    fn matched_file_splits_bandwidth_across_binds() {
        let mut table = ThrottleTable::new(vec![("*.html".to_string(), 1000, 0)]);
        let a = table.bind("/x.html", ConnId(0)).unwrap();
        assert_eq!(a.max_limit, 1000);
        let b = table.bind("/y.html", ConnId(1)).unwrap();
        assert_eq!(b.max_limit, 500);
    }

    #[test]
    fn rejects_when_rate_exceeds_double_max() {
        let mut table = ThrottleTable::new(vec![("*.html".to_string(), 1000, 0)]);
        table.rules[0].rate = 3000.0;
        assert!(table.bind("/x.html", ConnId(0)).is_none());
    }

    #[test]
    fn rebalance_redivides_share_as_binds_join_and_leave() {
        let mut table = ThrottleTable::new(vec![("*.html".to_string(), 900, 0)]);
        let a = table.bind("/x.html", ConnId(0)).unwrap();
        assert_eq!(a.max_limit, 900);
        table.bind("/y.html", ConnId(1)).unwrap();
        table.bind("/z.html", ConnId(2)).unwrap();

        let updates = table.rebalance();
        assert_eq!(updates.len(), 3);
        assert!(updates.iter().all(|(_, b)| b.max_limit == 300));

        table.unbind(&a, ConnId(0));
        let updates = table.rebalance();
        assert_eq!(updates.len(), 2);
        assert!(updates.iter().all(|(_, b)| b.max_limit == 450));
    }
}
