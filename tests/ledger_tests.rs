use spacepark::ledger::*;

fn seeded() -> (SqliteLedger, TerminalId, PadId) {
    let ledger = SqliteLedger::open_in_memory().unwrap();
    let terminal = ledger.add_terminal("Alpha").unwrap();
    let pad = ledger.add_pad(terminal, 40.0, 10, 80).unwrap();
    (ledger, terminal, pad)
}

fn ship(pad_id: PadId, license: &str, weight: f64, docked_at: Timestamp) -> NewShip {
    NewShip {
        pad_id,
        license: license.to_string(),
        weight,
        docked_at,
    }
}

#[test]
fn test_provisioning_round_trip() {
    let (ledger, terminal, pad) = seeded();
    let second = ledger.add_pad(terminal, 12.5, 3, 30).unwrap();

    let terminals = ledger.terminals().unwrap();
    assert_eq!(terminals, vec![Terminal { id: terminal, name: "Alpha".into() }]);

    let pads = ledger.pads().unwrap();
    assert_eq!(pads.len(), 2);
    assert_eq!(pads[0].id, pad);
    assert_eq!(pads[1].id, second);
    assert_eq!(ledger.pad(second).unwrap(), Some(pads[1].clone()));
    assert_eq!(pads[1].max_weight, 12.5);
    assert_eq!(pads[1].cost_hour, 3);
    assert_eq!(pads[1].cost_day, 30);
    assert_eq!(ledger.pad(999).unwrap(), None);
}

#[test]
fn test_duplicate_terminal_name_rejected() {
    let (ledger, _, _) = seeded();
    assert!(matches!(
        ledger.add_terminal("Alpha").unwrap_err(),
        StoreError::Constraint(_)
    ));
}

#[test]
fn test_pad_requires_existing_terminal_and_sane_values() {
    let (ledger, terminal, _) = seeded();

    assert!(matches!(
        ledger.add_pad(999, 10.0, 1, 1).unwrap_err(),
        StoreError::Constraint(_)
    ));
    assert!(matches!(
        ledger.add_pad(terminal, 0.0, 1, 1).unwrap_err(),
        StoreError::Constraint(_)
    ));
    assert!(matches!(
        ledger.add_pad(terminal, 10.0, -1, 1).unwrap_err(),
        StoreError::Constraint(_)
    ));
}

#[test]
fn test_conditional_insert_only_into_vacant_pad() {
    let (ledger, _, pad) = seeded();

    assert!(ledger.insert_ship_if_vacant(&ship(pad, "FIRST", 10.0, 1_000)).unwrap());
    assert!(!ledger.insert_ship_if_vacant(&ship(pad, "SECOND", 10.0, 2_000)).unwrap());

    let occupant = ledger.occupant(pad).unwrap().unwrap();
    assert_eq!(occupant.license, "FIRST");
    assert_eq!(occupant.docked_at, 1_000);

    let log = ledger.docking_log(Some(pad)).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].event, LogEvent::Dock);
}

#[test]
fn test_store_rejects_overweight_insert() {
    let (ledger, _, pad) = seeded();

    let err = ledger
        .insert_ship_if_vacant(&ship(pad, "BRICK", 41.0, 1_000))
        .unwrap_err();
    assert!(matches!(err, StoreError::Constraint(_)));
    assert!(ledger.occupant(pad).unwrap().is_none());
    assert!(ledger.docking_log(None).unwrap().is_empty());
}

#[test]
fn test_lowest_free_pad_ignores_occupied_and_small_pads() {
    let (ledger, terminal, first) = seeded();
    let second = ledger.add_pad(terminal, 40.0, 10, 80).unwrap();
    let small = ledger.add_pad(terminal, 5.0, 10, 80).unwrap();

    assert_eq!(ledger.lowest_free_pad(1.0).unwrap(), Some(first));
    ledger.insert_ship_if_vacant(&ship(first, "A", 1.0, 0)).unwrap();
    assert_eq!(ledger.lowest_free_pad(1.0).unwrap(), Some(second));
    ledger.insert_ship_if_vacant(&ship(second, "B", 1.0, 0)).unwrap();
    assert_eq!(ledger.lowest_free_pad(1.0).unwrap(), Some(small));
    assert_eq!(ledger.lowest_free_pad(5.0).unwrap(), None);
}

#[test]
fn test_remove_ship_returns_record_once() {
    let (ledger, _, pad) = seeded();
    ledger.insert_ship_if_vacant(&ship(pad, "LEAVER", 10.0, 1_000)).unwrap();

    let removed = ledger.remove_ship(pad, 5_000).unwrap().unwrap();
    assert_eq!(removed.license, "LEAVER");
    assert_eq!(removed.docked_at, 1_000);
    assert!(ledger.remove_ship(pad, 6_000).unwrap().is_none());

    let log = ledger.docking_log(None).unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].event, LogEvent::Undock);
    assert_eq!(log[1].time, 5_000);
}

#[test]
fn test_log_time_never_decreases() {
    let (ledger, _, pad) = seeded();
    ledger.insert_ship_if_vacant(&ship(pad, "SKEW", 10.0, 10_000)).unwrap();
    ledger.remove_ship(pad, 4_000).unwrap();

    let times: Vec<_> = ledger
        .docking_log(None)
        .unwrap()
        .into_iter()
        .map(|e| e.time)
        .collect();
    assert_eq!(times, vec![10_000, 10_000]);
}

#[test]
fn test_docking_log_filters_by_pad() {
    let (ledger, terminal, first) = seeded();
    let second = ledger.add_pad(terminal, 40.0, 10, 80).unwrap();

    ledger.insert_ship_if_vacant(&ship(first, "ONE", 1.0, 100)).unwrap();
    ledger.insert_ship_if_vacant(&ship(second, "TWO", 1.0, 200)).unwrap();
    ledger.remove_ship(first, 300).unwrap();

    assert_eq!(ledger.docking_log(None).unwrap().len(), 3);
    let first_log = ledger.docking_log(Some(first)).unwrap();
    assert_eq!(first_log.len(), 2);
    assert!(first_log.iter().all(|e| e.pad_id == first));
    assert_eq!(ledger.docking_log(Some(second)).unwrap().len(), 1);
}

#[test]
fn test_removing_pad_cascades_to_ship_but_keeps_log() {
    let (ledger, _, pad) = seeded();
    ledger.insert_ship_if_vacant(&ship(pad, "STRANDED", 10.0, 0)).unwrap();

    assert!(ledger.remove_pad(pad).unwrap());
    assert!(!ledger.remove_pad(pad).unwrap());
    assert!(ledger.ships().unwrap().is_empty());
    assert_eq!(ledger.docking_log(Some(pad)).unwrap().len(), 1);
}

#[test]
fn test_file_ledger_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("park.db");

    let pad = {
        let ledger = SqliteLedger::open(&path).unwrap();
        let terminal = ledger.add_terminal("Gamma").unwrap();
        let pad = ledger.add_pad(terminal, 30.0, 5, 40).unwrap();
        ledger.insert_ship_if_vacant(&ship(pad, "KEEPER", 3.0, 42)).unwrap();
        pad
    };

    let reopened = SqliteLedger::open(&path).unwrap();
    let occupant = reopened.occupant(pad).unwrap().unwrap();
    assert_eq!(occupant.license, "KEEPER");
    assert_eq!(reopened.terminals().unwrap()[0].name, "Gamma");
}

#[test]
fn test_license_is_stored_verbatim() {
    let (ledger, _, pad) = seeded();
    let tricky = "O'Brien'); DROP TABLE ships; --";
    ledger.insert_ship_if_vacant(&ship(pad, tricky, 1.0, 0)).unwrap();

    assert_eq!(ledger.occupant(pad).unwrap().unwrap().license, tricky);
    assert_eq!(ledger.ships().unwrap().len(), 1);
}
