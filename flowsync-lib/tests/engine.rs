//! Lifecycle scenarios against the loopback engine: entity cascades, rule
//! placement, lost-and-found adoption and teardown accounting.

mod common;

use common::*;

use flowsync_lib::graph::OperatingMode;
use flowsync_lib::rules::RuleState;
use flowsync_lib::tc_rule::RuleType;
use flowsync_lib::wire::{FilterEvent, Op, RtnlEvent};

#[test]
fn link_cycle() {
    let mut e = engine();

    e.handle_event(link(Op::New, 2, 123, LLADDR_A));
    assert_eq!(e.counts().links, 1);

    e.handle_event(link(Op::Del, 2, 123, LLADDR_A));
    assert_eq!(e.counts().links, 0);
    assert!(e.counts().all_zero());
}

#[test]
fn link_delete_takes_neighbours_along() {
    let mut e = engine();

    e.handle_event(link(Op::New, 2, 123, LLADDR_A));
    e.handle_event(neigh(Op::New, 2, "192.0.2.1", LLADDR_C));
    assert_eq!(e.counts().neighs, 1);

    e.handle_event(link(Op::Del, 2, 123, LLADDR_A));
    assert_eq!(e.counts().neighs, 0);
    assert_eq!(e.counts().links, 0);
}

#[test]
fn neighbour_delete_leaves_the_link() {
    let mut e = engine();

    e.handle_event(link(Op::New, 2, 123, LLADDR_A));
    e.handle_event(neigh(Op::New, 2, "192.0.2.1", LLADDR_C));
    e.handle_event(neigh(Op::Del, 2, "192.0.2.1", LLADDR_C));

    assert_eq!(e.counts().neighs, 0);
    assert_eq!(e.counts().links, 1);
}

#[test]
fn neighbours_for_unknown_links_are_ignored() {
    let mut e = engine();
    e.handle_event(neigh(Op::New, 9, "192.0.2.1", LLADDR_C));
    assert!(e.counts().all_zero());
}

fn route_setup(e: &mut flowsync_lib::engine::Engine) {
    e.handle_event(link(Op::New, 2, 123, LLADDR_A));
    e.handle_event(neigh(Op::New, 2, "192.0.2.1", LLADDR_C));
    e.handle_event(route(Op::New, "192.0.2.128/25", 2, "192.0.2.1"));
}

#[test]
fn route_install_places_forward_and_goto_rules() {
    let mut e = engine();
    route_setup(&mut e);

    assert_eq!(e.counts().routes, 1);
    assert_eq!(e.counts().targets, 1);
    // the forward intent exists, but the pin still freezes everything
    assert_eq!(e.counts().rules, 1);
    assert_eq!(installs(&e), 0);

    e.remove_pin();

    assert_eq!(e.counts().rules, 2);
    assert_eq!(installs(&e), 2);

    let forward = e.rules().pos_lookup(5, 1).expect("forward rule");
    {
        let rb = forward.borrow();
        assert_eq!(rb.state, RuleState::Ok);
        let have = rb.have.as_ref().expect("installed");
        assert_eq!(have.rtype, RuleType::Forward);
        assert_eq!(have.vlan_id, 123);
        assert_eq!(have.src_mac, LLADDR_A);
        assert_eq!(have.dst_mac, LLADDR_C);
    }

    let goto = e.rules().pos_lookup(1, 100).expect("goto rule");
    {
        let rb = goto.borrow();
        assert_eq!(rb.state, RuleState::Ok);
        let have = rb.have.as_ref().expect("installed");
        assert_eq!(have.rtype, RuleType::RouteGoto);
        assert_eq!(have.dst, prefix("192.0.2.128/25"));
        assert_eq!(have.goto_chain, 5);
    }
}

#[test]
fn mutations_are_serialized_in_fifo_order() {
    let mut e = engine();
    route_setup(&mut e);
    e.remove_pin();

    // the forward rule must hit the wire before the goto pointing at it
    let types: Vec<u16> = e.sent_log().iter().map(|m| m.message_type).collect();
    assert_eq!(types.len(), 2);
    let first = flowsync_lib::wire::split_frames(&e.sent_log()[0].bytes).expect("frames");
    let second = flowsync_lib::wire::split_frames(&e.sent_log()[1].bytes).expect("frames");
    // chain number lives in the decoded event
    let filt = test_config().decode_filter();
    let ev1 = flowsync_lib::wire::decode(&first[0], &filt).expect("decodable");
    let ev2 = flowsync_lib::wire::decode(&second[0], &filt).expect("decodable");
    match (ev1, ev2) {
        (
            Some(RtnlEvent::Filter(FilterEvent { chain_no: 5, .. })),
            Some(RtnlEvent::Filter(FilterEvent { chain_no: 1, .. })),
        ) => {}
        other => panic!("unexpected order {other:?}"),
    }
}

#[test]
fn route_delete_uninstalls_the_goto_rule() {
    let mut e = engine();
    route_setup(&mut e);
    e.remove_pin();
    assert_eq!(e.counts().rules, 2);

    e.handle_event(route(Op::Del, "192.0.2.128/25", 2, "192.0.2.1"));

    assert_eq!(e.counts().routes, 0);
    assert_eq!(uninstalls(&e), 1);
    // the forward rule stays with its target
    assert_eq!(e.counts().rules, 1);
    let forward = e.rules().pos_lookup(5, 1).expect("forward rule");
    assert_eq!(forward.borrow().state, RuleState::Ok);
}

#[test]
fn mac_change_replaces_forward_rule_and_repoints_gotos() {
    let mut e = engine();
    route_setup(&mut e);
    e.remove_pin();

    e.handle_event(link(Op::New, 2, 123, LLADDR_B));

    // one replacement install for the forward rule, one for the goto; the
    // stale pair is withdrawn
    assert_eq!(e.counts().rules, 2);
    assert_eq!(uninstalls(&e), 2);
    assert_eq!(installs(&e), 4);

    let forward = e.rules().pos_lookup(6, 1).expect("replacement forward rule");
    {
        let rb = forward.borrow();
        assert_eq!(rb.state, RuleState::Ok);
        let have = rb.have.as_ref().expect("installed");
        // source follows the link, destination still mirrors the neighbour
        assert_eq!(have.src_mac, LLADDR_B);
        assert_eq!(have.dst_mac, LLADDR_C);
    }

    let goto = e.rules().pos_lookup(1, 101).expect("repointed goto rule");
    {
        let rb = goto.borrow();
        assert_eq!(rb.state, RuleState::Ok);
        assert_eq!(rb.have.as_ref().expect("installed").goto_chain, 6);
    }
}

#[test]
fn neighbour_resolution_after_route_installs_late() {
    let mut e = engine();
    e.handle_event(link(Op::New, 2, 123, LLADDR_A));
    // the route arrives first; its neighbour is created degenerate
    e.handle_event(route(Op::New, "192.0.2.128/25", 2, "192.0.2.1"));
    e.remove_pin();

    assert_eq!(e.counts().neighs, 1);
    assert_eq!(e.counts().rules, 0);
    assert_eq!(installs(&e), 0);

    // resolution arrives, the target becomes eligible
    e.handle_event(neigh(Op::New, 2, "192.0.2.1", LLADDR_C));

    assert_eq!(e.counts().rules, 2);
    assert_eq!(installs(&e), 2);
    let forward = e.rules().pos_lookup(5, 1).expect("forward rule");
    assert_eq!(forward.borrow().state, RuleState::Ok);
}

#[test]
fn lost_and_found_adoption_avoids_reinstalling() {
    let mut e = engine();
    // classification only: nothing may be installed or removed yet
    e.advance_pin_to(1);

    // the previous process's forward rule shows up in the scan first
    e.handle_event(RtnlEvent::Filter(FilterEvent {
        op: Op::New,
        chain_no: 5,
        prio: 1,
        rule: Some(forward_rule(123, LLADDR_A, LLADDR_C)),
    }));
    assert_eq!(e.counts().rules, 1);

    route_setup(&mut e);

    // the intent matched the observed rule byte for byte: adopted, not
    // reinstalled; the goto rule is primed but gated by the pin
    assert_eq!(e.counts().rules, 2);
    assert_eq!(installs(&e), 0);
    assert_eq!(uninstalls(&e), 0);

    let forward = e.rules().pos_lookup(5, 1).expect("adopted rule");
    assert_eq!(forward.borrow().state, RuleState::Ok);

    // lifting the pin only has to install the goto rule
    e.remove_pin();
    assert_eq!(installs(&e), 1);
    assert_eq!(e.counts().rules, 2);
}

#[test]
fn unmatched_kernel_rules_are_uninstalled_as_alien() {
    let mut e = engine();
    e.handle_event(RtnlEvent::Filter(FilterEvent {
        op: Op::New,
        chain_no: 7,
        prio: 3,
        rule: Some(forward_rule(77, LLADDR_B, LLADDR_C)),
    }));
    assert_eq!(e.counts().rules, 1);

    e.remove_pin();

    assert_eq!(uninstalls(&e), 1);
    assert_eq!(e.counts().rules, 0);
}

#[test]
fn teardown_cascade_emits_exactly_the_installed_deletes() {
    let mut e = engine();
    route_setup(&mut e);
    e.remove_pin();
    assert_eq!(installs(&e), 2);

    e.set_mode(OperatingMode::Teardown);
    e.handle_event(link(Op::Del, 2, 123, LLADDR_A));

    assert!(e.counts().all_zero(), "counts: {:?}", e.counts());
    assert_eq!(uninstalls(&e), 2);
}

#[test]
fn dry_run_emits_nothing() {
    let mut cfg = test_config();
    cfg.dry_run = true;
    let mut e = flowsync_lib::engine::Engine::new_loopback(cfg);

    route_setup(&mut e);
    e.remove_pin();
    e.set_mode(OperatingMode::Teardown);
    e.handle_event(link(Op::Del, 2, 123, LLADDR_A));

    assert_eq!(e.sent_log().len(), 0);
    assert!(e.counts().all_zero(), "counts: {:?}", e.counts());
}

#[test]
fn static_seeding_installs_the_skeleton() {
    let mut e = engine();
    e.seed_static_rules();
    assert_eq!(e.counts().rules, 4);
    assert_eq!(installs(&e), 0);

    e.remove_pin();
    assert_eq!(installs(&e), 4);

    let v4_dispatch = e.rules().pos_lookup(0, 1).expect("v4 dispatch");
    {
        let rb = v4_dispatch.borrow();
        assert_eq!(rb.state, RuleState::Ok);
        let have = rb.have.as_ref().expect("installed");
        assert_eq!(have.rtype, RuleType::RouteGoto);
        assert_eq!(have.goto_chain, 1);
    }
    let v6_dispatch = e.rules().pos_lookup(0, 2).expect("v6 dispatch");
    {
        let rb = v6_dispatch.borrow();
        let have = rb.have.as_ref().expect("installed");
        assert_eq!(have.goto_chain, 2);
        // the hardware cannot match ::/0; dispatch covers unicast space
        assert_eq!(have.dst, prefix("2000::/3"));
    }

    for (chain_no, prio) in [(1, 1), (2, 1)] {
        let ttl = e.rules().pos_lookup(chain_no, prio).expect("ttl check");
        let rb = ttl.borrow();
        assert_eq!(rb.state, RuleState::Ok);
        assert_eq!(rb.have.as_ref().expect("installed").rtype, RuleType::TtlCheck);
    }
}

#[test]
fn prefix_lists_seed_trap_rules() {
    let mut cfg = test_config();
    cfg.prefix_lists
        .add_prefix("onload", "192.0.2.0/24")
        .expect("valid prefix");
    cfg.prefix_lists
        .add_prefix("onload", "2001:db8:ffff::/48")
        .expect("valid prefix");
    let mut e = flowsync_lib::engine::Engine::new_loopback(cfg);

    e.seed_static_rules();
    e.remove_pin();
    assert_eq!(e.counts().rules, 6);

    let v4_trap = e.rules().pos_lookup(1, 10).expect("v4 trap");
    {
        let rb = v4_trap.borrow();
        assert_eq!(rb.state, RuleState::Ok);
        let have = rb.have.as_ref().expect("installed");
        assert_eq!(have.rtype, RuleType::RouteTrap);
        assert_eq!(have.dst, prefix("192.0.2.0/24"));
    }
    let v6_trap = e.rules().pos_lookup(2, 10).expect("v6 trap");
    assert_eq!(
        v6_trap.borrow().have.as_ref().expect("installed").dst,
        prefix("2001:db8:ffff::/48")
    );
}

#[test]
fn clearing_releases_static_rules_without_uninstalling() {
    let mut e = engine();
    e.seed_static_rules();
    e.remove_pin();
    assert_eq!(e.counts().rules, 4);

    e.set_mode(OperatingMode::Teardown);
    e.clear_rules();

    // static rules persist in the kernel; we only forget about them
    assert_eq!(e.counts().rules, 0);
    assert_eq!(uninstalls(&e), 0);
}

#[test]
fn kernel_side_delete_is_absorbed_and_reinstalled() {
    let mut e = engine();
    route_setup(&mut e);
    e.remove_pin();
    assert_eq!(installs(&e), 2);

    // someone removes the forward rule behind our back; the state machine
    // re-requests it
    e.handle_event(RtnlEvent::Filter(FilterEvent {
        op: Op::Del,
        chain_no: 5,
        prio: 1,
        rule: None,
    }));

    let forward = e.rules().pos_lookup(5, 1).expect("forward rule");
    assert_eq!(forward.borrow().state, RuleState::Ok);
    assert_eq!(installs(&e), 3);
}
