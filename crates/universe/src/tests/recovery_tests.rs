use super::helpers::*;
use crate::*;
use anyhow::Result;
use atom::Particle;
use atomfile::AtomDataFileError;
use std::collections::BTreeMap;
use std::fs;
use tempfile::tempdir;

// --------------------- Round trip ---------------------

#[test]
fn committed_atoms_survive_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("store.db");

    let (id, ucn) = {
        let store = Universe::create(config_at(&path), BTreeMap::new())?;
        let mut tx = store.begin();
        let h = tx.create_atom();
        tx.add_junction(h, NAME, "a")?;
        tx.add_junction(h, SIZE, 7i64)?;
        let committed = tx.commit()?;
        store.close()?;
        (h.id(), committed.ucn.unwrap())
    };

    let store = Universe::open(config_at(&path))?;
    let atom = store.get_atom(id).expect("atom replayed");
    assert_eq!(atom.ucn(), ucn);
    assert_eq!(atom.value(NAME), Some(&Particle::IsoString("a".into())));
    assert_eq!(atom.value(SIZE), Some(&Particle::Integer(7)));
    assert_eq!(atom.len(), 2);
    assert_eq!(store.ucn(), ucn + 1);
    Ok(())
}

#[test]
fn reopen_without_close_recovers_everything() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("store.db");
    {
        let store = Universe::create(config_at(&path), BTreeMap::new())?;
        commit_named(&store, &[("a", 1), ("b", 2)])?;
        commit_named(&store, &[("c", 3)])?;
        // dropped without close
    }

    let store = Universe::open(config_at(&path))?;
    assert_eq!(store.atom_count(), 3);
    assert_eq!(store.ucn(), FIRST_UCN + 2);
    assert_eq!(names(&store.global_index().all().to_vec()?), vec!["c", "a", "b"]);
    Ok(())
}

#[test]
fn commits_continue_after_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("store.db");
    {
        let store = Universe::create(config_at(&path), BTreeMap::new())?;
        commit_named(&store, &[("a", 1)])?;
        store.close()?;
    }
    {
        let store = Universe::open(config_at(&path))?;
        let c = commit_named(&store, &[("b", 2)])?;
        assert_eq!(c.ucn, Some(FIRST_UCN + 1));
        assert!(c.atoms[0].id() > 0);
        store.close()?;
    }

    let store = Universe::open(config_at(&path))?;
    assert_eq!(store.atom_count(), 2);
    assert_eq!(store.ucn(), FIRST_UCN + 2);
    Ok(())
}

#[test]
fn uncommitted_slots_read_as_never_after_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("store.db");
    let (gap, last) = {
        let store = Universe::create(config_at(&path), BTreeMap::new())?;
        let mut open_tx = store.begin();
        let gap = open_tx.create_atom();
        let c = commit_named(&store, &[("after-gap", 1)])?;
        // simulate a crash: the open expansion never finishes
        std::mem::forget(open_tx);
        (gap.id(), c.atoms[0].id())
    };

    let store = Universe::open(config_at(&path))?;
    assert!(matches!(store.state().get_atom_or_special(gap), Slot::Never));
    assert!(store.get_atom(last).is_some());
    Ok(())
}

#[test]
fn hosted_bytes_survive_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("store.db");
    let config = UniverseConfig {
        file_hosted_threshold: 32,
        ..config_at(&path)
    };
    let blob: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();

    let (id, before) = {
        let store = Universe::create(config.clone(), BTreeMap::new())?;
        let mut tx = store.begin();
        let h = tx.create_atom();
        tx.add_junction(h, BLOB, blob.clone())?;
        tx.commit()?;
        let before = store.get_atom(h.id()).unwrap().value(BLOB).cloned().unwrap();
        store.close()?;
        (h.id(), before)
    };

    let store = Universe::open(config)?;
    let after = store.get_atom(id).unwrap().value(BLOB).cloned().unwrap();
    assert_eq!(after, before);
    assert_eq!(store.read_bytes(&after)?, blob);
    Ok(())
}

// --------------------- Header ---------------------

#[test]
fn header_information_is_exposed() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("store.db");
    let mut metadata = BTreeMap::new();
    metadata.insert("owner".to_string(), "tracker".to_string());

    let id = {
        let store = Universe::create(config_at(&path), metadata.clone())?;
        assert_eq!(store.format_version(), Some(atomfile::CURRENT_VERSION));
        let id = store.store_id().expect("file-backed store has an id");
        store.close()?;
        id
    };

    let store = Universe::open(config_at(&path))?;
    assert_eq!(store.store_id(), Some(id));
    assert_eq!(store.custom_metadata(), Some(&metadata));

    let memory = memory_store();
    assert!(memory.store_id().is_none());
    assert!(memory.custom_metadata().is_none());
    Ok(())
}

#[test]
fn create_refuses_existing_store_and_open_refuses_missing_one() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("store.db");

    assert!(Universe::open(config_at(&path)).is_err());
    Universe::create(config_at(&path), BTreeMap::new())?.close()?;
    let err = Universe::create(config_at(&path), BTreeMap::new()).unwrap_err();
    assert!(matches!(
        err,
        UniverseError::DataFile(AtomDataFileError::AlreadyExists(_))
    ));
    Ok(())
}

#[test]
fn open_or_create_handles_both_cases() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("store.db");
    {
        let store = Universe::open_or_create(config_at(&path))?;
        commit_named(&store, &[("x", 1)])?;
        store.close()?;
    }
    let store = Universe::open_or_create(config_at(&path))?;
    assert_eq!(store.atom_count(), 1);
    Ok(())
}

// --------------------- Corruption ---------------------

#[test]
fn flipped_payload_byte_fails_open() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("store.db");
    {
        let store = Universe::create(config_at(&path), BTreeMap::new())?;
        commit_named(&store, &[("intact", 1)])?;
        commit_named(&store, &[("mutated", 2)])?;
        store.close()?;
    }

    let mut data = fs::read(&path)?;
    let at = data
        .windows(7)
        .position(|w| w == b"mutated")
        .expect("payload present");
    data[at] = b'M';
    fs::write(&path, &data)?;

    match Universe::open(config_at(&path)) {
        Err(UniverseError::DataFile(AtomDataFileError::RecordCrcMismatch { offset })) => {
            assert!(offset < at as u64);
        }
        other => panic!("expected a CRC mismatch, got {other:?}"),
    }
    Ok(())
}

#[test]
fn torn_tail_fails_open_unless_repaired() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("store.db");
    {
        let store = Universe::create(config_at(&path), BTreeMap::new())?;
        commit_named(&store, &[("whole", 1)])?;
        commit_named(&store, &[("torn", 2)])?;
        store.close()?;
    }
    let data = fs::read(&path)?;
    fs::write(&path, &data[..data.len() - 2])?;

    assert!(matches!(
        Universe::open(config_at(&path)),
        Err(UniverseError::DataFile(AtomDataFileError::Truncated { .. }))
    ));

    let repair = UniverseConfig {
        repair_torn_tail: true,
        ..config_at(&path)
    };
    {
        let store = Universe::open(repair.clone())?;
        assert_eq!(names(&store.global_index().all().to_vec()?), vec!["whole"]);
        assert_eq!(store.ucn(), FIRST_UCN + 1);
        commit_named(&store, &[("after-repair", 3)])?;
        store.close()?;
    }

    // the repaired file opens without repair
    let store = Universe::open(config_at(&path))?;
    assert_eq!(store.atom_count(), 2);
    Ok(())
}

#[test]
fn repair_leaves_damaged_record_with_intact_successors_alone() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("store.db");
    {
        let store = Universe::create(config_at(&path), BTreeMap::new())?;
        commit_named(&store, &[("intact", 1)])?;
        commit_named(&store, &[("second", 2)])?;
        commit_named(&store, &[("third", 3)])?;
        store.close()?;
    }
    let mut data = fs::read(&path)?;
    let at = data
        .windows(6)
        .position(|w| w == b"intact")
        .expect("payload present");
    // string length now runs past the end of the file
    data[at - 1] = 0x7f;
    fs::write(&path, &data)?;

    let repair = UniverseConfig {
        repair_torn_tail: true,
        ..config_at(&path)
    };
    assert!(matches!(
        Universe::open(repair),
        Err(UniverseError::DataFile(AtomDataFileError::Corrupt { .. }))
    ));
    assert_eq!(fs::read(&path)?, data);
    Ok(())
}

#[test]
fn torn_tail_is_not_repaired_in_read_only_mode() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("store.db");
    {
        let store = Universe::create(config_at(&path), BTreeMap::new())?;
        commit_named(&store, &[("torn", 1)])?;
    }
    let data = fs::read(&path)?;
    fs::write(&path, &data[..data.len() - 1])?;

    let config = UniverseConfig {
        repair_torn_tail: true,
        read_only: true,
        ..config_at(&path)
    };
    assert!(Universe::open(config).is_err());
    assert_eq!(fs::read(&path)?.len(), data.len() - 1);
    Ok(())
}

#[test]
fn garbage_file_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("store.db");
    fs::write(&path, b"definitely not a store")?;
    assert!(matches!(
        Universe::open(config_at(&path)),
        Err(UniverseError::DataFile(AtomDataFileError::BadMagic))
    ));
    Ok(())
}

// --------------------- Replay into State ---------------------

#[test]
fn replay_rejects_ucns_going_backwards() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("store.db");
    {
        let mut file = atomfile::AtomDataFile::create(&path, BTreeMap::new(), false)?;
        file.append_expansion(5, &[atom::AtomBuilder::new(0)], 0)?;
        file.append_expansion(3, &[atom::AtomBuilder::new(1)], 0)?;
    }

    let mut file = atomfile::AtomDataFile::open(&path, false, true)?;
    let state = State::new(UcnOrder::Descending);
    let err = replay_into_state(&mut file, &state, false).unwrap_err();
    assert!(matches!(
        err,
        AtomDataFileError::UcnOutOfOrder { ucn: 3, expected: 6, .. }
    ));
    Ok(())
}

#[test]
fn replay_rejects_atoms_stored_twice() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("store.db");
    {
        let mut file = atomfile::AtomDataFile::create(&path, BTreeMap::new(), false)?;
        file.append_expansion(1, &[atom::AtomBuilder::new(4)], 0)?;
        file.append_expansion(2, &[atom::AtomBuilder::new(4)], 0)?;
    }

    let mut file = atomfile::AtomDataFile::open(&path, false, true)?;
    let state = State::new(UcnOrder::Descending);
    let err = replay_into_state(&mut file, &state, false).unwrap_err();
    assert!(matches!(err, AtomDataFileError::DuplicateAtom { id: 4, .. }));
    Ok(())
}

#[test]
fn replay_tolerates_ucn_gaps() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("store.db");
    {
        let mut file = atomfile::AtomDataFile::create(&path, BTreeMap::new(), false)?;
        file.append_expansion(2, &[atom::AtomBuilder::new(0).with(1, 1i64)], 0)?;
        file.append_expansion(9, &[atom::AtomBuilder::new(3).with(1, 2i64)], 0)?;
    }

    let mut file = atomfile::AtomDataFile::open(&path, false, true)?;
    let state = State::new(UcnOrder::Descending);
    let summary = replay_into_state(&mut file, &state, false)?;
    assert_eq!(summary.records, 2);
    assert_eq!(state.ucn(), 10);
    assert_eq!(state.slot_count(), 4);
    assert!(matches!(state.get_atom_or_special(1), Slot::Never));
    assert_eq!(state.get_atom(3).map(|a| a.ucn()), Some(9));
    Ok(())
}
