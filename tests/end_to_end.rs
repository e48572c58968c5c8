use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::atomic::AtomicBool;

use gcdbg::census::synth::SyntheticHeap;
use gcdbg::census::{CensusOptions, CensusSession};
use gcdbg::layout::{HeapLayout, LayoutModel};
use gcdbg::roots::{dump, Checker, Finding, RootingConfig};

const TC: u64 = 0x5000;

fn two_object_nursery(layout: &HeapLayout) -> SyntheticHeap<'_> {
    let mut h = SyntheticHeap::new(layout);
    let table = h.table("P6opaque", Some("Point"));
    let gen2 = h.gen2();
    h.zero(0x1000, 0x100);
    h.object(0x1000, 0x80, table);
    h.object(0x1080, 0x80, table);
    h.zero(TC, 0x100);
    h.thread(TC, 4, (0x1000, 0x1100, 0x1100), gen2);
    h
}

#[test]
fn full_nursery_census() {
    let layout = HeapLayout::default();
    let mem = two_object_nursery(&layout).into_segments();
    let model = LayoutModel::new(&mem, &layout);
    let mut session = CensusSession::new(CensusOptions { seed: Some(1), ..Default::default() });

    let report = session.walk_heap(&model, TC, &AtomicBool::new(false)).unwrap().unwrap();
    assert!(report.diagnostics.is_empty(), "{:?}", report.diagnostics);
    assert_eq!(report.generation, 4);
    assert_eq!(report.nursery.stats.total(), 2);
    assert_eq!(report.nursery.stats.names.get(&"Point".to_string()), 2);
    assert_eq!(report.nursery.occupancy(), 1.0);
    assert!(report.size_classes.iter().all(|sc| sc.is_unallocated()));

    let mut out = vec![];
    report.render(&mut out, 50).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("the current generation of the gc is 4\n"));
    assert!(text.contains("Point"));
    assert!(!text.contains("problems during the walk"));
}

#[test]
fn census_from_a_saved_snapshot() {
    let layout = HeapLayout::default();
    let mem = two_object_nursery(&layout).into_segments();
    let symbols = BTreeMap::from([("tc".to_string(), TC)]);

    let mut zip = gcdbg::save_snapshot(Cursor::new(vec![]), &mem, &symbols, Some(&layout)).unwrap();
    zip.set_position(0);
    let snap = gcdbg::load_snapshot(zip).unwrap();
    let layout = snap.layout.unwrap();
    let model = LayoutModel::new(&snap.memory, &layout);

    let mut session = CensusSession::new(CensusOptions { seed: Some(1), ..Default::default() });
    let cancel = AtomicBool::new(false);
    session.walk_heap(&model, snap.symbols["tc"], &cancel).unwrap().unwrap();
    session.walk_heap(&model, snap.symbols["tc"], &cancel).unwrap().unwrap();

    let mut out = vec![];
    session.diff(&[], &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("nursery state --DIFF--:\n"));
}

const DUMP: &str = "
# list construction with a forgotten root
function build_list
param tc: struct MVMThreadContext *
param type: struct MVMObject *
local list: struct MVMObject *
local item: struct MVMObject *
local buf: char *
bb 2
    call MVM_gc_root_temp_push(tc, &type) @ list.c:10
    list = call MVM_repr_alloc_init(tc, type) @ list.c:11
    buf = call MVM_malloc(16) @ list.c:12
bb 3 <- 2
    call MVM_exception_throw_adhoc(tc, \"no\") @ list.c:14
bb 4 <- 2
    item = call MVM_repr_alloc_init(tc, type) @ list.c:16
    call MVM_repr_push_o(tc, list, item) @ list.c:17
    call MVM_free(buf) @ list.c:18
    call MVM_gc_root_temp_pop(tc) @ list.c:19
    return list @ list.c:20
end
";

#[test]
fn dump_through_the_checker() {
    let procs = dump::parse(DUMP).unwrap();
    let mut checker = Checker::new(RootingConfig::default());

    let roots: Vec<String> = checker.check_roots(&procs[0]).iter().map(Finding::to_string).collect();
    assert_eq!(
        roots,
        ["missing root for 'list' in item = MVM_repr_alloc_init (tc, type) at list.c:16 \
          used in MVM_repr_push_o (tc, list, item) at list.c:17"],
    );

    let throws: Vec<String> = checker.check_throw(&procs[0]).iter().map(Finding::to_string).collect();
    assert_eq!(
        throws,
        ["possible missing free before a throw in build_list at list.c:14, might need freeing: buf"],
    );

    // Everything was already reported once.
    assert!(checker.check_roots(&procs[0]).is_empty());
}
