//! Refine-pass tests: exact narrowing against live memory, the
//! unknown-value scan, fuzzy condition refines and the degenerate
//! empty-store starts.

use std::sync::Arc;
use std::time::Duration;

use super::mock_memory::MockMemory;
use super::{TestBlock, test_engine, wait_terminal, wait_until};
use crate::search::engine::SearchStatus;
use crate::search::types::{FuzzyCondition, ValueType};

const BASE: u64 = 0x7200_0000;

#[test]
fn refine_narrows_to_live_values() {
    let mock = Arc::new(MockMemory::new());
    let range = mock.add_region(BASE, 64 * 1024);
    let addresses: Vec<u64> = (0..4u64).map(|i| BASE + 0x100 * i).collect();
    for &addr in &addresses {
        mock.poke_u32(addr, 77);
    }

    let (engine, _dir) = test_engine(Arc::clone(&mock));
    engine
        .start_search_async("77", ValueType::Dword, vec![range], false)
        .unwrap();
    wait_terminal(&engine);
    assert_eq!(engine.total_results().unwrap(), 4);

    // The target "changes" one value; only the survivors still hold 77.
    mock.poke_u32(addresses[2], 78);
    engine.start_refine_async("77", ValueType::Dword).unwrap();
    wait_terminal(&engine);

    assert_eq!(engine.session_status(), SearchStatus::Completed);
    let items = engine.results(0, 10).unwrap();
    assert_eq!(items.len(), 3);
    let survivors: Vec<u64> = items.iter().map(|item| item.address()).collect();
    assert_eq!(survivors, vec![addresses[0], addresses[1], addresses[3]]);
    // Positions are renumbered densely after the refine.
    for (i, item) in items.iter().enumerate() {
        assert_eq!(item.native_position(), i as u64);
    }
}

#[test]
fn refine_snapshots_updated_values() {
    let mock = Arc::new(MockMemory::new());
    let range = mock.add_region(BASE, 64 * 1024);
    mock.poke_u32(BASE + 0x40, 100);
    mock.poke_u32(BASE + 0x80, 100);

    let (engine, _dir) = test_engine(Arc::clone(&mock));
    engine
        .start_search_async("100", ValueType::Dword, vec![range], false)
        .unwrap();
    wait_terminal(&engine);
    assert_eq!(engine.total_results().unwrap(), 2);

    mock.poke_u32(BASE + 0x40, 200);
    engine.start_refine_async("200", ValueType::Dword).unwrap();
    wait_terminal(&engine);

    let items = engine.results(0, 10).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].address(), BASE + 0x40);
    assert_eq!(items[0].display_value(), "200");
}

#[test]
fn refine_on_empty_store_completes_with_zero() {
    let mock = Arc::new(MockMemory::new());
    mock.add_region(BASE, 64 * 1024);

    let (engine, _dir) = test_engine(Arc::clone(&mock));
    let mut block = TestBlock::new();
    block.register(&engine);

    engine.start_refine_async("5", ValueType::Dword).unwrap();
    wait_terminal(&engine);

    assert_eq!(engine.session_status(), SearchStatus::Completed);
    assert_eq!(block.status(), SearchStatus::Completed as i32);
    assert_eq!(block.found_count(), 0);
    assert_eq!(engine.total_results().unwrap(), 0);
    assert_eq!(engine.last_summary().map(|s| s.total_found), Some(0));
}

#[test]
fn fuzzy_refine_on_empty_store_completes_with_zero() {
    let mock = Arc::new(MockMemory::new());
    mock.add_region(BASE, 64 * 1024);

    let (engine, _dir) = test_engine(Arc::clone(&mock));
    engine.start_fuzzy_refine_async(FuzzyCondition::Changed).unwrap();
    wait_terminal(&engine);
    assert_eq!(engine.session_status(), SearchStatus::Completed);
    assert_eq!(engine.last_summary().map(|s| s.total_found), Some(0));
}

#[test]
fn unknown_scan_records_every_aligned_slot() {
    let mock = Arc::new(MockMemory::new());
    let range = mock.add_region(BASE, 64 * 1024);

    let (engine, _dir) = test_engine(Arc::clone(&mock));
    let mut block = TestBlock::new();
    block.register(&engine);

    engine
        .start_unknown_search_async(ValueType::Dword, vec![range])
        .unwrap();
    wait_terminal(&engine);

    assert_eq!(engine.session_status(), SearchStatus::Completed);
    let expected = (64 * 1024 / 4) as u64;
    assert_eq!(engine.total_results().unwrap(), expected);
    assert_eq!(block.found_count(), expected as i64);

    let first = engine.results(0, 2).unwrap();
    assert_eq!(first[0].address(), BASE);
    assert_eq!(first[1].address(), BASE + 4);
}

#[test]
fn fuzzy_increased_finds_bumped_slot() {
    let mock = Arc::new(MockMemory::new());
    let range = mock.add_region(BASE, 64 * 1024);
    mock.poke_u32(BASE + 0x20, 500);
    mock.poke_u32(BASE + 0x40, 500);

    let (engine, _dir) = test_engine(Arc::clone(&mock));
    engine
        .start_unknown_search_async(ValueType::Dword, vec![range])
        .unwrap();
    wait_terminal(&engine);

    mock.poke_u32(BASE + 0x20, 505);
    engine
        .start_fuzzy_refine_async(FuzzyCondition::Increased)
        .unwrap();
    wait_terminal(&engine);

    assert_eq!(engine.session_status(), SearchStatus::Completed);
    let items = engine.results(0, 10).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].address(), BASE + 0x20);
    // The survivor's snapshot is the new value, ready for the next pass.
    assert_eq!(items[0].display_value(), "505");
}

#[test]
fn fuzzy_unchanged_then_increased_by() {
    let mock = Arc::new(MockMemory::new());
    let range = mock.add_region(BASE, 64 * 1024);
    mock.poke_u32(BASE + 0x100, 90);
    mock.poke_u32(BASE + 0x200, 90);
    mock.poke_u32(BASE + 0x300, 90);

    let (engine, _dir) = test_engine(Arc::clone(&mock));
    engine
        .start_unknown_search_async(ValueType::Dword, vec![range])
        .unwrap();
    wait_terminal(&engine);

    // Slot at 0x100 moves, the rest stay put.
    mock.poke_u32(BASE + 0x100, 91);
    engine
        .start_fuzzy_refine_async(FuzzyCondition::Unchanged)
        .unwrap();
    wait_terminal(&engine);
    let after_unchanged = engine.total_results().unwrap();
    assert_eq!(after_unchanged, (64 * 1024 / 4) - 1);

    // Now bump one survivor by exactly 10 and isolate it.
    mock.poke_u32(BASE + 0x200, 100);
    engine
        .start_fuzzy_refine_async(FuzzyCondition::IncreasedBy(10))
        .unwrap();
    wait_terminal(&engine);

    let items = engine.results(0, 10).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].address(), BASE + 0x200);
    assert_eq!(items[0].display_value(), "100");
}

#[test]
fn cancelled_refine_keeps_previous_result_set() {
    let mock = Arc::new(MockMemory::new());
    // Matches spaced a page apart so every refine read is its own batch.
    let range = mock.add_region(BASE, 2 * 1024 * 1024);
    for i in 0..256u64 {
        mock.poke_u32(BASE + 8192 * i, 1234);
    }

    let (engine, _dir) = test_engine(Arc::clone(&mock));
    engine
        .start_search_async("1234", ValueType::Dword, vec![range], false)
        .unwrap();
    wait_terminal(&engine);
    assert_eq!(engine.total_results().unwrap(), 256);

    mock.set_read_delay(Duration::from_millis(5));
    engine.start_refine_async("1234", ValueType::Dword).unwrap();
    assert!(wait_until(Duration::from_secs(5), || engine.is_searching()));
    engine.request_cancel();
    wait_terminal(&engine);

    assert_eq!(engine.session_status(), SearchStatus::Cancelled);
    assert_eq!(engine.total_results().unwrap(), 256);
}

#[test]
fn refine_drops_records_of_other_types() {
    let mock = Arc::new(MockMemory::new());
    let range = mock.add_region(BASE, 64 * 1024);
    mock.poke_u32(BASE + 0x10, 77);

    let (engine, _dir) = test_engine(Arc::clone(&mock));
    engine
        .start_search_async("77", ValueType::Dword, vec![range], false)
        .unwrap();
    wait_terminal(&engine);
    assert_eq!(engine.total_results().unwrap(), 1);

    // A Word refine cannot keep Dword records even if the low bytes
    // would match.
    engine.start_refine_async("77", ValueType::Word).unwrap();
    wait_terminal(&engine);
    assert_eq!(engine.session_status(), SearchStatus::Completed);
    assert_eq!(engine.total_results().unwrap(), 0);
}
