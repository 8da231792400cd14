use assert_call::{call, CallRecorder};

use super::*;

fn record(list: &DiagnosticList<&'static str>) -> Subscription {
    list.subscribe(|changes| {
        let changes: Vec<_> = changes.iter().map(|c| c.to_string()).collect();
        call!("{}", changes.join(","));
    })
}

#[test]
fn new_is_empty() {
    let list = DiagnosticList::<&str>::new(3);
    assert_eq!(list.slot_count(), 3);
    assert_eq!(list.len(), 0);
    assert!(list.is_empty());
    assert_eq!(list.get(0), None);
}

#[test]
fn set_and_clear() {
    let mut cr = CallRecorder::new();
    let list = DiagnosticList::new(2);
    let _s = record(&list);

    list.set_diagnostic(1, "b", false);
    cr.verify("added(1)");
    list.set_diagnostic(0, "a", true);
    cr.verify("added(0)");
    assert_eq!(list.to_vec(), vec!["a", "b"]);
    assert_eq!(list.is_valid(0), Some(true));
    assert_eq!(list.is_valid(1), Some(false));

    list.set_diagnostic(1, "c", false);
    cr.verify("replaced(1)");
    assert_eq!(list.get(1), Some("c"));

    list.clear_diagnostic(0);
    cr.verify("removed(0)");
    assert_eq!(list.to_vec(), vec!["c"]);
    assert_eq!(list.get(0), Some("c"));
}

#[test]
fn clear_empty_slot_is_silent() {
    let mut cr = CallRecorder::new();
    let list = DiagnosticList::<&str>::new(1);
    let _s = record(&list);
    list.clear_diagnostic(0);
    cr.verify(());
}

#[test]
fn quiescent_batch_reports_net_changes() {
    let mut cr = CallRecorder::new();
    let list = DiagnosticList::new(4);
    list.set_diagnostic(1, "old", false);
    list.set_diagnostic(3, "gone", false);
    let _s = record(&list);

    list.begin_quiescence();
    list.set_diagnostic(2, "new", true);
    list.clear_diagnostic(1);
    list.set_diagnostic(1, "again", false);
    list.set_diagnostic(0, "tmp", false);
    list.clear_diagnostic(0);
    list.clear_diagnostic(3);
    cr.verify(());
    list.end_quiescence();
    cr.verify("replaced(1),added(2),removed(3)");
    assert_eq!(list.to_vec(), vec!["again", "new"]);
}

#[test]
fn quiescent_batch_without_changes_is_silent() {
    let mut cr = CallRecorder::new();
    let list = DiagnosticList::<&str>::new(1);
    let _s = record(&list);
    list.begin_quiescence();
    list.set_diagnostic(0, "tmp", true);
    list.clear_diagnostic(0);
    list.end_quiescence();
    cr.verify(());
}

#[test]
#[should_panic]
fn nested_quiescence_panics() {
    let list = DiagnosticList::<&str>::new(1);
    list.begin_quiescence();
    list.begin_quiescence();
}

#[test]
#[should_panic]
fn end_without_begin_panics() {
    let list = DiagnosticList::<&str>::new(1);
    list.end_quiescence();
}

#[test]
fn sub_lists_are_live() {
    let list = DiagnosticList::new(3);
    let valid = list.valid_sub_list();
    let invalid = list.invalid_sub_list();
    assert!(valid.is_empty());
    assert!(invalid.is_empty());

    list.set_diagnostic(0, "w", true);
    list.set_diagnostic(2, "e", false);
    assert_eq!(valid.to_vec(), vec!["w"]);
    assert_eq!(invalid.to_vec(), vec!["e"]);
    assert_eq!(
        invalid.entries(),
        vec![DiagnosticEntry {
            slot: 2,
            diagnostic: "e",
            is_valid: false
        }]
    );

    list.set_diagnostic(0, "e0", false);
    assert!(valid.is_empty());
    assert_eq!(invalid.len(), 2);
    assert_eq!(invalid.get(0), Some("e0"));
}

#[test]
fn slot_lookup() {
    let list = DiagnosticList::new(2);
    list.set_diagnostic(1, 10, false);
    assert_eq!(list.slot(0), None);
    assert_eq!(
        list.slot(1),
        Some(DiagnosticEntry {
            slot: 1,
            diagnostic: 10,
            is_valid: false
        })
    );
    assert_eq!(list.slot(5), None);
}

#[test]
fn unsubscribe_on_drop() {
    let mut cr = CallRecorder::new();
    let list = DiagnosticList::new(1);
    let s = record(&list);
    list.set_diagnostic(0, "a", false);
    cr.verify("added(0)");
    drop(s);
    list.clear_diagnostic(0);
    cr.verify(());
}

#[test]
fn debug() {
    let list = DiagnosticList::new(2);
    list.set_diagnostic(1, "x", false);
    assert_eq!(format!("{list:?}"), r#"["x"]"#);
}
