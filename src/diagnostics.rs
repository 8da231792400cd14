use std::{cell::RefCell, rc::Rc};

use derive_ex::derive_ex;
use parse_display::Display;

use crate::{utils::Listeners, Subscription};

#[cfg(test)]
mod tests;

/// How one slot of a [`DiagnosticList`] changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display(style = "lowercase")]
pub enum DiagnosticChangeKind {
    Added,
    Removed,
    Replaced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("{kind}({slot})")]
pub struct DiagnosticChange {
    /// Index of the constraint that owns the slot.
    pub slot: usize,
    pub kind: DiagnosticChangeKind,
}

/// A diagnostic together with the constraint slot it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticEntry<D> {
    pub slot: usize,
    pub diagnostic: D,
    pub is_valid: bool,
}

/// Diagnostics of a constrained value, one slot per constraint.
///
/// The list exposes the occupied slots in constraint order.
/// A slot holds the diagnostic of the latest completed run of its constraint and is emptied as soon as the next run starts.
///
/// Only the validation engine writes to the list. Observers read it and subscribe to [`DiagnosticChange`]s.
#[derive_ex(Clone, bound())]
pub struct DiagnosticList<D: 'static>(Rc<DiagnosticListNode<D>>);

struct DiagnosticListNode<D: 'static> {
    data: RefCell<DiagnosticSlots<D>>,
    listeners: Listeners<dyn Fn(&[DiagnosticChange])>,
}
impl<D: 'static> DiagnosticListNode<D> {
    fn listeners(&self) -> &Listeners<dyn Fn(&[DiagnosticChange])> {
        &self.listeners
    }
}

struct DiagnosticSlots<D> {
    slots: Vec<Option<Entry<D>>>,
    quiescent: bool,
    origins: Vec<Option<bool>>,
}

struct Entry<D> {
    diagnostic: D,
    is_valid: bool,
}

impl<D> DiagnosticSlots<D> {
    fn iter(&self, filter: Option<bool>) -> impl Iterator<Item = (usize, &Entry<D>)> + '_ {
        self.slots.iter().enumerate().filter_map(move |(slot, e)| {
            let e = e.as_ref()?;
            if filter.map_or(true, |is_valid| is_valid == e.is_valid) {
                Some((slot, e))
            } else {
                None
            }
        })
    }

    /// Returns the change to fire now, or `None` if nothing changed or the change is deferred.
    fn record(&mut self, slot: usize, was_occupied: bool) -> Option<DiagnosticChange> {
        if self.quiescent {
            self.origins[slot].get_or_insert(was_occupied);
            return None;
        }
        let kind = match (was_occupied, self.slots[slot].is_some()) {
            (false, true) => DiagnosticChangeKind::Added,
            (true, false) => DiagnosticChangeKind::Removed,
            (true, true) => DiagnosticChangeKind::Replaced,
            (false, false) => return None,
        };
        Some(DiagnosticChange { slot, kind })
    }

    fn take_batch(&mut self) -> Vec<DiagnosticChange> {
        self.quiescent = false;
        let mut changes = Vec::new();
        for slot in 0..self.slots.len() {
            if let Some(was_occupied) = self.origins[slot].take() {
                changes.extend(self.record(slot, was_occupied));
            }
        }
        changes
    }
}

impl<D: 'static> DiagnosticList<D> {
    pub(crate) fn new(slot_count: usize) -> Self {
        Self(Rc::new(DiagnosticListNode {
            data: RefCell::new(DiagnosticSlots {
                slots: (0..slot_count).map(|_| None).collect(),
                quiescent: false,
                origins: vec![None; slot_count],
            }),
            listeners: Listeners::new(),
        }))
    }

    pub(crate) fn set_diagnostic(&self, slot: usize, diagnostic: D, is_valid: bool) {
        let change = {
            let mut data = self.0.data.borrow_mut();
            let was_occupied = data.slots[slot].is_some();
            data.slots[slot] = Some(Entry {
                diagnostic,
                is_valid,
            });
            data.record(slot, was_occupied)
        };
        if let Some(change) = change {
            self.fire(&[change]);
        }
    }

    pub(crate) fn clear_diagnostic(&self, slot: usize) {
        let change = {
            let mut data = self.0.data.borrow_mut();
            if data.slots[slot].take().is_none() {
                return;
            }
            data.record(slot, true)
        };
        if let Some(change) = change {
            self.fire(&[change]);
        }
    }

    pub(crate) fn begin_quiescence(&self) {
        let mut data = self.0.data.borrow_mut();
        if data.quiescent {
            panic!("`DiagnosticList` is already quiescent.");
        }
        data.quiescent = true;
    }

    pub(crate) fn end_quiescence(&self) {
        let changes = {
            let mut data = self.0.data.borrow_mut();
            if !data.quiescent {
                panic!("`DiagnosticList` is not quiescent.");
            }
            data.take_batch()
        };
        if !changes.is_empty() {
            self.fire(&changes);
        }
    }

    fn fire(&self, changes: &[DiagnosticChange]) {
        for listener in self.0.listeners.snapshot() {
            listener(changes);
        }
    }

    /// Calls `f` with the changes of each update.
    ///
    /// Changes made while the owning value is quiescent arrive as one batch holding the net change of each slot.
    pub fn subscribe(&self, f: impl Fn(&[DiagnosticChange]) + 'static) -> Subscription {
        self.0.listeners.subscribe(
            Rc::downgrade(&self.0),
            DiagnosticListNode::listeners,
            Rc::new(f),
        )
    }

    /// Number of slots, which equals the number of constraints.
    pub fn slot_count(&self) -> usize {
        self.0.data.borrow().slots.len()
    }

    /// Number of diagnostics present.
    pub fn len(&self) -> usize {
        self.0.data.borrow().iter(None).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<D>
    where
        D: Clone,
    {
        get(&self.0.data.borrow(), None, index)
    }

    /// Returns whether the diagnostic at `index` was produced by a successful run.
    pub fn is_valid(&self, index: usize) -> Option<bool> {
        let data = self.0.data.borrow();
        let is_valid = data.iter(None).nth(index).map(|(_, e)| e.is_valid);
        is_valid
    }

    /// Returns the diagnostic of the constraint at `slot`.
    pub fn slot(&self, slot: usize) -> Option<DiagnosticEntry<D>>
    where
        D: Clone,
    {
        let data = self.0.data.borrow();
        let entry = data.slots.get(slot)?.as_ref()?;
        Some(to_entry(slot, entry))
    }

    pub fn entries(&self) -> Vec<DiagnosticEntry<D>>
    where
        D: Clone,
    {
        entries(&self.0.data.borrow(), None)
    }

    pub fn to_vec(&self) -> Vec<D>
    where
        D: Clone,
    {
        to_vec(&self.0.data.borrow(), None)
    }

    /// A live view of the diagnostics produced by successful runs.
    pub fn valid_sub_list(&self) -> DiagnosticSubList<D> {
        DiagnosticSubList {
            list: self.clone(),
            is_valid: true,
        }
    }

    /// A live view of the diagnostics produced by failed runs.
    pub fn invalid_sub_list(&self) -> DiagnosticSubList<D> {
        DiagnosticSubList {
            list: self.clone(),
            is_valid: false,
        }
    }
}
impl<D: std::fmt::Debug> std::fmt::Debug for DiagnosticList<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.data.try_borrow() {
            Ok(data) => f
                .debug_list()
                .entries(data.iter(None).map(|(_, e)| &e.diagnostic))
                .finish(),
            Err(_) => write!(f, "<borrowed>"),
        }
    }
}

/// Diagnostics of a [`DiagnosticList`] filtered by validity.
///
/// The view holds no copy; every access reads the current slots of the list.
#[derive_ex(Clone, bound())]
pub struct DiagnosticSubList<D: 'static> {
    list: DiagnosticList<D>,
    is_valid: bool,
}

impl<D: 'static> DiagnosticSubList<D> {
    pub fn len(&self) -> usize {
        self.list.0.data.borrow().iter(Some(self.is_valid)).count()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn get(&self, index: usize) -> Option<D>
    where
        D: Clone,
    {
        get(&self.list.0.data.borrow(), Some(self.is_valid), index)
    }
    pub fn entries(&self) -> Vec<DiagnosticEntry<D>>
    where
        D: Clone,
    {
        entries(&self.list.0.data.borrow(), Some(self.is_valid))
    }
    pub fn to_vec(&self) -> Vec<D>
    where
        D: Clone,
    {
        to_vec(&self.list.0.data.borrow(), Some(self.is_valid))
    }
}

fn to_entry<D: Clone>(slot: usize, entry: &Entry<D>) -> DiagnosticEntry<D> {
    DiagnosticEntry {
        slot,
        diagnostic: entry.diagnostic.clone(),
        is_valid: entry.is_valid,
    }
}
fn get<D: Clone>(data: &DiagnosticSlots<D>, filter: Option<bool>, index: usize) -> Option<D> {
    data.iter(filter)
        .nth(index)
        .map(|(_, e)| e.diagnostic.clone())
}
fn entries<D: Clone>(data: &DiagnosticSlots<D>, filter: Option<bool>) -> Vec<DiagnosticEntry<D>> {
    data.iter(filter).map(|(slot, e)| to_entry(slot, e)).collect()
}
fn to_vec<D: Clone>(data: &DiagnosticSlots<D>, filter: Option<bool>) -> Vec<D> {
    data.iter(filter).map(|(_, e)| e.diagnostic.clone()).collect()
}
