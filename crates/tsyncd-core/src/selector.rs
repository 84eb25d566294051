//! Best-instance selection.
//!
//! Each selection tick the engine feeds every instance's status through the
//! deterministic rule below and learns which instance (if any) should hold
//! clock control. A change event fires only when the elected index moves.

use crate::sync::status::{SyncInstanceStatus, SyncState};

/// The ordering key: smaller wins. Ties resolve to the first candidate in
/// iteration order, so two instances reporting an identical grandmaster and
/// quality keep the earlier one selected (strict less-than comparison).
fn selection_key(s: &SyncInstanceStatus) -> (u8, u8, f64, u16, [u8; 8]) {
    (
        s.user_priority,
        s.grandmaster.clock_class,
        s.grandmaster.accuracy_ns,
        s.grandmaster.steps_removed,
        s.grandmaster.clock_id.0,
    )
}

/// Strict lexicographic less-than over the key. The accuracy field is a
/// float (infinity for unknown) so the tuple is compared element-wise.
fn key_less(a: &SyncInstanceStatus, b: &SyncInstanceStatus) -> bool {
    let ka = selection_key(a);
    let kb = selection_key(b);
    if ka.0 != kb.0 {
        return ka.0 < kb.0;
    }
    if ka.1 != kb.1 {
        return ka.1 < kb.1;
    }
    if ka.2 != kb.2 {
        return ka.2 < kb.2;
    }
    if ka.3 != kb.3 {
        return ka.3 < kb.3;
    }
    ka.4 < kb.4
}

/// Minimum of `candidates` by the selection key, first-wins on ties.
fn best_of(statuses: &[SyncInstanceStatus], candidates: &[usize]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for &i in candidates {
        match best {
            None => best = Some(i),
            Some(b) => {
                if key_less(&statuses[i], &statuses[b]) {
                    best = Some(i);
                }
            }
        }
    }
    best
}

/// Rank for the final non-slave fallback: prefer states closest to tracking.
fn state_rank(state: SyncState) -> u8 {
    match state {
        SyncState::Slave => 0,
        SyncState::Master => 1,
        SyncState::Passive => 2,
        SyncState::Listening => 3,
        SyncState::Faulty => 4,
        SyncState::Disabled => 5,
    }
}

/// The selector. Holds the previous outcome and any manual override.
#[derive(Default)]
pub struct Selector {
    selected: Option<usize>,
    /// Manual pin by instance name; takes precedence until cleared.
    override_name: Option<String>,
}

/// Outcome of one selection tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub index: Option<usize>,
    /// True when the elected index differs from the previous tick.
    pub changed: bool,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin selection to a named instance. Passing `None` clears the pin.
    pub fn set_override(&mut self, name: Option<String>) {
        match &name {
            Some(n) => log::info!("selector: manual override -> {n}"),
            None => log::info!("selector: manual override cleared"),
        }
        self.override_name = name;
    }

    pub fn override_name(&self) -> Option<&str> {
        self.override_name.as_deref()
    }

    pub fn selected(&self) -> Option<usize> {
        self.selected
    }

    /// Run the deterministic rule over the current statuses.
    ///
    /// Passes, in order:
    /// 1. manual override by name, if pinned and present;
    /// 2. SLAVE instances with no alarms, by the ordering key;
    /// 3. SLAVE instances ignoring alarms, by the ordering key;
    /// 4. any SLAVE instance in priority order;
    /// 5. the highest-quality non-SLAVE instance.
    pub fn select(&mut self, statuses: &[SyncInstanceStatus]) -> Selection {
        let index = self.pick(statuses);
        let changed = index != self.selected;
        if changed {
            match index {
                Some(i) => log::info!(
                    "selector: elected '{}' (priority {})",
                    statuses[i].name,
                    statuses[i].user_priority
                ),
                None => log::warn!("selector: no instance selectable"),
            }
        }
        self.selected = index;
        Selection { index, changed }
    }

    fn pick(&self, statuses: &[SyncInstanceStatus]) -> Option<usize> {
        if statuses.is_empty() {
            return None;
        }
        if let Some(name) = &self.override_name {
            if let Some(i) = statuses.iter().position(|s| &s.name == name) {
                return Some(i);
            }
            log::warn!("selector: override '{name}' names no instance, ignoring");
        }

        let clean: Vec<usize> = (0..statuses.len())
            .filter(|&i| statuses[i].is_clean_slave())
            .collect();
        if let Some(i) = best_of(statuses, &clean) {
            return Some(i);
        }

        // Relax: ignore alarm bits.
        let slaves: Vec<usize> = (0..statuses.len())
            .filter(|&i| statuses[i].state == SyncState::Slave)
            .collect();
        if let Some(i) = best_of(statuses, &slaves) {
            return Some(i);
        }

        // Any slave by priority: covered above; fall back to the
        // highest-quality non-slave.
        (0..statuses.len()).min_by(|&a, &b| {
            let ka = (state_rank(statuses[a].state), statuses[a].user_priority);
            let kb = (state_rank(statuses[b].state), statuses[b].user_priority);
            ka.cmp(&kb)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleKind;
    use crate::sync::status::Alarm;

    fn slave(name: &str, priority: u8) -> SyncInstanceStatus {
        let mut s = SyncInstanceStatus::new(name, ModuleKind::Freerun, priority);
        s.state = SyncState::Slave;
        s.grandmaster.clock_class = 248;
        s.grandmaster.accuracy_ns = 1000.0;
        s.grandmaster.steps_removed = 1;
        s
    }

    #[test]
    fn test_priority_tie_break() {
        // Identical quality, A priority 128, B priority 64: B wins.
        let statuses = vec![slave("a", 128), slave("b", 64)];
        let mut sel = Selector::new();
        let out = sel.select(&statuses);
        assert_eq!(out.index, Some(1));
        assert!(out.changed);
    }

    #[test]
    fn test_alarmed_better_candidate_loses() {
        let a = slave("a", 128);
        let mut b = slave("b", 64);
        b.alarms = Alarm::NO_FOLLOW_UPS;
        let statuses = vec![a, b];
        let mut sel = Selector::new();
        assert_eq!(sel.select(&statuses).index, Some(0));
    }

    #[test]
    fn test_all_alarmed_falls_back_by_priority() {
        let mut a = slave("a", 128);
        a.alarms = Alarm::NO_FOLLOW_UPS;
        let mut b = slave("b", 64);
        b.alarms = Alarm::NO_FOLLOW_UPS;
        let statuses = vec![a, b];
        let mut sel = Selector::new();
        assert_eq!(sel.select(&statuses).index, Some(1));
    }

    #[test]
    fn test_steps_removed_tie_break() {
        let mut a = slave("a", 128);
        a.grandmaster.steps_removed = 2;
        let mut b = slave("b", 128);
        b.grandmaster.steps_removed = 5;
        let statuses = vec![b, a];
        let mut sel = Selector::new();
        // The index of "a" in this ordering is 1.
        assert_eq!(sel.select(&statuses).index, Some(1));
    }

    #[test]
    fn test_identical_candidates_keep_first() {
        let statuses = vec![slave("first", 128), slave("second", 128)];
        let mut sel = Selector::new();
        assert_eq!(sel.select(&statuses).index, Some(0));
    }

    #[test]
    fn test_change_event_only_on_movement() {
        let statuses = vec![slave("a", 128), slave("b", 64)];
        let mut sel = Selector::new();
        assert!(sel.select(&statuses).changed);
        assert!(!sel.select(&statuses).changed);
        // Alarm B: selection moves to A and reports the change.
        let mut moved = statuses.clone();
        moved[1].alarms = Alarm::NO_SYNC_PKTS;
        let out = sel.select(&moved);
        assert_eq!(out.index, Some(0));
        assert!(out.changed);
    }

    #[test]
    fn test_manual_override_pins_until_cleared() {
        let statuses = vec![slave("a", 128), slave("b", 64)];
        let mut sel = Selector::new();
        sel.set_override(Some("a".into()));
        assert_eq!(sel.select(&statuses).index, Some(0));
        sel.set_override(None);
        assert_eq!(sel.select(&statuses).index, Some(1));
    }

    #[test]
    fn test_non_slave_fallback() {
        let mut a = SyncInstanceStatus::new("a", ModuleKind::Ptp, 128);
        a.state = SyncState::Listening;
        let mut b = SyncInstanceStatus::new("b", ModuleKind::Ptp, 64);
        b.state = SyncState::Master;
        let statuses = vec![a, b];
        let mut sel = Selector::new();
        // No slaves at all: the master outranks the listener.
        assert_eq!(sel.select(&statuses).index, Some(1));
    }

    #[test]
    fn test_empty_input() {
        let mut sel = Selector::new();
        let out = sel.select(&[]);
        assert_eq!(out.index, None);
        assert!(!out.changed);
    }

    #[test]
    fn test_accuracy_tie_break_before_steps() {
        let mut a = slave("a", 128);
        a.grandmaster.accuracy_ns = 100.0;
        a.grandmaster.steps_removed = 9;
        let mut b = slave("b", 128);
        b.grandmaster.accuracy_ns = 1000.0;
        b.grandmaster.steps_removed = 1;
        let statuses = vec![b, a];
        let mut sel = Selector::new();
        assert_eq!(sel.select(&statuses).index, Some(1));
    }
}
